use crate::message::MessageId;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("{kind} `{name}` does not exist")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} `{name}` is still in use")]
    InUse { kind: &'static str, name: String },

    #[error("Malformed filter expression at offset {position}: {reason}")]
    FilterSyntax { position: usize, reason: String },

    #[error("Message {0} is not in flight")]
    UnknownInFlight(MessageId),

    #[error("Invalid configuration `{0}`")]
    InvalidConfig(String),

    #[error("Failed to read configuration")]
    Io(#[from] io::Error),
}

impl BrokerError {
    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        BrokerError::NotFound {
            kind,
            name: name.to_owned(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, name: &str) -> Self {
        BrokerError::AlreadyExists {
            kind,
            name: name.to_owned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
