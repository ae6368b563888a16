//! State machine trait and the built-in key-value machine.
//!
//! The engine treats the state machine as opaque: it feeds committed
//! commands in index order and asks for full-state snapshots during
//! compaction. Applies are synchronous; implementations must not block.

use crate::error::{ReplicaError, Result};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Replicated state machine hooks.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command. Errors are reported to the submitting
    /// client but never stall the apply loop.
    fn apply_command(&mut self, name: &str, args: &Value) -> Result<Value>;

    /// Serialize the full state for snapshotting.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the full state from a snapshot payload.
    fn install_snapshot(&mut self, data: &[u8]) -> Result<()>;
}

/// Key-value state machine (string key, JSON value).
///
/// Commands: `put {key, value}`, `get {key}`, `remove {key}`.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    state: HashMap<String, Value>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read access, used by tests and the node status shell.
    pub fn state(&self) -> &HashMap<String, Value> {
        &self.state
    }

    fn key_arg(args: &Value) -> Result<&str> {
        args.get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ReplicaError::UnknownCommand("missing key argument".to_string()))
    }
}

impl StateMachine for KvStateMachine {
    fn apply_command(&mut self, name: &str, args: &Value) -> Result<Value> {
        match name {
            "put" => {
                let key = Self::key_arg(args)?;
                let value = args.get("value").cloned().unwrap_or(Value::Null);
                debug!("KvStateMachine: put {}={}", key, value);
                let previous = self.state.insert(key.to_string(), value);
                Ok(previous.unwrap_or(Value::Null))
            }
            "get" => {
                let key = Self::key_arg(args)?;
                Ok(self.state.get(key).cloned().unwrap_or(Value::Null))
            }
            "remove" => {
                let key = Self::key_arg(args)?;
                Ok(self.state.remove(key).unwrap_or(Value::Null))
            }
            other => Err(ReplicaError::UnknownCommand(other.to_string())),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn install_snapshot(&mut self, data: &[u8]) -> Result<()> {
        self.state = serde_json::from_slice(data)?;
        debug!("KvStateMachine: installed snapshot ({} keys)", self.state.len());
        Ok(())
    }
}
