//! Shared key-value store threaded through a stage run (§4.10), and the
//! concrete value type it holds.
//!
//! Kept as a closed enum rather than `dyn Any` so the whole store stays
//! `Send + Sync + Clone` and round-trips through the checkpoint layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ContextValue {
    Bytes(Vec<u8>),
    U64(u64),
    I64(i64),
    Str(String),
    Bool(bool),
}

impl ContextValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ContextValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ContextValue::U64(v) => Some(*v),
            ContextValue::I64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ContextValue::I64(v) => Some(*v),
            ContextValue::U64(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ContextValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Dotted-path store populated by `exports` and consumed by `from_context`
/// fields. Values set by an earlier stage are visible to every later stage
/// in the same run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolContext {
    values: HashMap<String, ContextValue>,
}

impl ProtocolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: ContextValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn merge(&mut self, other: ProtocolContext) {
        self.values.extend(other.values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_stage_sees_earlier_export() {
        let mut ctx = ProtocolContext::new();
        ctx.set("session_token", ContextValue::Bytes(vec![1, 2, 3]));
        assert_eq!(
            ctx.get("session_token").and_then(ContextValue::as_bytes),
            Some(&[1u8, 2, 3][..])
        );
    }

    #[test]
    fn missing_key_is_none() {
        let ctx = ProtocolContext::new();
        assert!(ctx.get("nope").is_none());
    }
}
