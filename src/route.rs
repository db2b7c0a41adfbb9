//!
//! This module defines routings, which bind a source topic to a destination queue
//! through an ordered chain of filter operators, and the Router that owns them.
//!
use crate::config::KeyValue;
use crate::error::{BrokerError, Result};
use crate::filter::Filter;
use crate::message::Message;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct OperatorState {
    filter: Arc<Filter>,
    config: KeyValue,
}

/// A named filter predicate. Routings share operators, so updating an operator's
/// expression takes effect in every chain holding it.
pub struct Operator {
    name: String,
    state: RwLock<OperatorState>,
}

impl Operator {
    pub(crate) fn new(name: &str, filter: Filter, config: KeyValue) -> Self {
        Operator {
            name: name.to_owned(),
            state: RwLock::new(OperatorState {
                filter: Arc::new(filter),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> Arc<Filter> {
        match self.state.read() {
            Ok(state) => Arc::clone(&state.filter),
            Err(e) => Arc::clone(&e.into_inner().filter),
        }
    }

    pub fn expression(&self) -> String {
        self.filter().source().to_owned()
    }

    pub fn config(&self) -> KeyValue {
        match self.state.read() {
            Ok(state) => state.config.clone(),
            Err(e) => e.into_inner().config.clone(),
        }
    }

    pub(crate) fn update(&self, filter: Filter, config: KeyValue) {
        let next = OperatorState {
            filter: Arc::new(filter),
            config,
        };
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(e) => *e.into_inner() = next,
        }
    }

    pub fn evaluate(&self, message: &Message) -> bool {
        self.filter().evaluate(message)
    }
}

#[derive(Clone)]
pub struct Routing {
    name: String,
    source: String,
    destination: String,
    operators: Vec<Arc<Operator>>,
    config: KeyValue,
}

impl Routing {
    pub(crate) fn new(name: &str, source: &str, destination: &str, config: KeyValue) -> Self {
        Routing {
            name: name.to_owned(),
            source: source.to_owned(),
            destination: destination.to_owned(),
            operators: Vec::new(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn config(&self) -> &KeyValue {
        &self.config
    }

    /// Names of the operators in evaluation order.
    pub fn operators(&self) -> Vec<&str> {
        self.operators.iter().map(|op| op.name()).collect()
    }

    /// True iff every operator accepts the message, evaluated left to right and
    /// stopping at the first rejection. An empty chain accepts everything.
    pub fn route(&self, message: &Message) -> bool {
        self.operators.iter().all(|op| op.evaluate(message))
    }
}

/// Router maintains the routing table.
#[derive(Default)]
pub(crate) struct Router {
    routings: HashMap<String, Routing>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Routing> {
        self.routings.get(name)
    }

    /// Insert a routing, or re-point an existing one while keeping its operator chain.
    /// Returns the previous source topic when the routing already existed.
    pub(crate) fn upsert(
        &mut self,
        name: &str,
        source: &str,
        destination: &str,
        config: KeyValue,
    ) -> Option<String> {
        match self.routings.get_mut(name) {
            Some(routing) => {
                let previous = std::mem::replace(&mut routing.source, source.to_owned());
                routing.destination = destination.to_owned();
                routing.config = config;
                Some(previous)
            }
            None => {
                self.routings
                    .insert(name.to_owned(), Routing::new(name, source, destination, config));
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Routing> {
        self.routings.remove(name)
    }

    /// Append `operator` to the chain of `routing`.
    ///
    /// # Errors
    /// Raise BrokerError::NotFound if the routing does not exist.
    pub(crate) fn add_operator(&mut self, routing: &str, operator: Arc<Operator>) -> Result<()> {
        let entry = self
            .routings
            .get_mut(routing)
            .ok_or_else(|| BrokerError::not_found("routing", routing))?;
        entry.operators.push(operator);
        Ok(())
    }

    /// Whether any routing delivers into `queue`.
    pub(crate) fn targets_queue(&self, queue: &str) -> bool {
        self.routings.values().any(|r| r.destination == queue)
    }
}
