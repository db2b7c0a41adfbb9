use crate::config::KeyValue;

/// A topic is a stateless publish point: it keeps no messages, only the ordered
/// names of the routings fed by it.
#[derive(Debug, Clone)]
pub struct Topic {
    name: String,
    config: KeyValue,
    routings: Vec<String>,
}

impl Topic {
    pub(crate) fn new(name: &str, config: KeyValue) -> Self {
        Topic {
            name: name.to_owned(),
            config,
            routings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &KeyValue {
        &self.config
    }

    /// Names of attached routings in attachment order.
    pub fn routings(&self) -> &[String] {
        &self.routings
    }

    pub(crate) fn set_config(&mut self, config: KeyValue) {
        self.config = config;
    }

    pub(crate) fn attach_routing(&mut self, routing: &str) {
        if !self.routings.iter().any(|r| r == routing) {
            self.routings.push(routing.to_owned());
        }
    }

    pub(crate) fn detach_routing(&mut self, routing: &str) {
        self.routings.retain(|r| r != routing);
    }
}
