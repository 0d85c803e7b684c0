use std::collections::HashMap;

use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
};

/// Well-known context key holding the rendered notice body produced by a
/// service's action phase and consumed by notifiers.
pub const NOTICE_CONTENT: &str = "notice_content";

/// A typed value stored in an [`EventContext`] key/value bag.
///
/// Using a tagged union instead of `Box<dyn Any>` keeps reads checked: a
/// consumer asking for the wrong shape gets `None` instead of a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Text(String),
    Uint(u64),
    Address(Address),
    Hash(B256),
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.to_owned())
    }
}

impl From<u64> for ContextValue {
    fn from(value: u64) -> Self {
        ContextValue::Uint(value)
    }
}

impl From<Address> for ContextValue {
    fn from(value: Address) -> Self {
        ContextValue::Address(value)
    }
}

impl From<B256> for ContextValue {
    fn from(value: B256) -> Self {
        ContextValue::Hash(value)
    }
}

/// Per-dispatch scratch space.
///
/// Wraps the triggering log (absent only when a service is restarted by the
/// failover loop with no event to replay) plus a key/value bag used to pass
/// derived facts from the decision phase (`need_handle`) to the action phase
/// (`execute`) of a single dispatch. A context is scoped to exactly one
/// dispatch and is discarded after `execute` returns.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    event: Option<Log>,
    data: HashMap<&'static str, ContextValue>,
}

impl EventContext {
    /// Context wrapping a triggering log.
    #[must_use]
    pub fn new(event: Log) -> Self {
        Self { event: Some(event), data: HashMap::new() }
    }

    /// Context with no triggering event (failover restart without replay).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The triggering log, if any.
    #[must_use]
    pub fn event(&self) -> Option<&Log> {
        self.event.as_ref()
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<ContextValue>) {
        self.data.insert(key, value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.data.get(key)
    }

    /// Typed accessor for [`ContextValue::Text`] entries.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.data.get(key) {
            Some(ContextValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Typed accessor for [`ContextValue::Uint`] entries.
    #[must_use]
    pub fn uint(&self, key: &str) -> Option<u64> {
        match self.data.get(key) {
            Some(ContextValue::Uint(value)) => Some(*value),
            _ => None,
        }
    }

    /// Typed accessor for [`ContextValue::Address`] entries.
    #[must_use]
    pub fn address(&self, key: &str) -> Option<Address> {
        match self.data.get(key) {
            Some(ContextValue::Address(address)) => Some(*address),
            _ => None,
        }
    }

    /// Typed accessor for [`ContextValue::Hash`] entries.
    #[must_use]
    pub fn hash(&self, key: &str) -> Option<B256> {
        match self.data.get(key) {
            Some(ContextValue::Hash(hash)) => Some(*hash),
            _ => None,
        }
    }
}
