use bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{self, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Well-known property carrying the message tag, as used by filter expressions.
pub const TAGS: &str = "TAGS";

/// Process-wide unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    // Generate next identifier, strictly increasing within the process.
    fn next() -> Self {
        static SEQUENCE: atomic::AtomicU64 = atomic::AtomicU64::new(1);
        MessageId(SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,

    /// User defined properties in form of key-value pairs.
    /// Routing operators evaluate their filter expressions against these.
    properties: HashMap<String, String>,

    /// Milliseconds since epoch at which the message was created.
    born_timestamp: u64,

    body: bytes::Bytes,
}

impl Message {
    pub fn new(body: impl Into<bytes::Bytes>) -> Self {
        let born_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Message {
            id: MessageId::next(),
            properties: HashMap::new(),
            born_timestamp,
            body: body.into(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn with_tag(self, tag: &str) -> Self {
        self.with_property(TAGS, tag)
    }

    /// Copy of this message carrying a fresh identifier.
    ///
    /// Every queue receives its own copy so that one id is never held by two queues.
    pub(crate) fn fork(&self) -> Self {
        Message {
            id: MessageId::next(),
            ..self.clone()
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn tag(&self) -> Option<&str> {
        self.property(TAGS)
    }

    pub fn born_timestamp(&self) -> u64 {
        self.born_timestamp
    }

    pub fn body(&self) -> bytes::Bytes {
        self.body.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let message_0 = Message::new("a");
        let message_1 = Message::new("b");
        assert!(message_0.id() < message_1.id());
        assert!(message_0.born_timestamp() > 0);
    }

    #[test]
    fn test_fork() {
        let message = Message::new("Test Body").with_tag("TagA");
        let copy = message.fork();
        assert_ne!(message.id(), copy.id());
        assert_eq!(copy.tag(), Some("TagA"));
        assert_eq!(copy.body(), message.body());
    }
}
