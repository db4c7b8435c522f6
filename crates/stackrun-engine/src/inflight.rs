//! Process-wide tracking of mutating operations per stack.
//!
//! A token must be held while a create/update/delete is issued and until the
//! stack reaches a terminal status. Dropping the token releases the stack.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use stackrun_core::{StackError, StackName};

/// Kind of mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    token: Uuid,
    operation: Operation,
    acquired_at: DateTime<Utc>,
}

/// Registry of stack name to in-flight operation, guarded by a single lock.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: Mutex<HashMap<StackName, Entry>>,
}

impl InFlightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the token for `stack`, failing with `InProgress` if another
    /// operation holds it.
    pub fn acquire(
        self: &Arc<Self>,
        stack: &StackName,
        operation: Operation,
    ) -> Result<InFlightToken, StackError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(stack) {
            return Err(StackError::InProgress {
                name: stack.to_string(),
                operation: existing.operation.to_string(),
            });
        }

        let token = Uuid::new_v4();
        entries.insert(
            stack.clone(),
            Entry {
                token,
                operation,
                acquired_at: Utc::now(),
            },
        );
        debug!(stack = %stack, operation = %operation, "Acquired in-flight token");

        Ok(InFlightToken {
            registry: Arc::clone(self),
            stack: stack.clone(),
            token,
        })
    }

    /// Operation currently in flight for `stack`, if any.
    pub fn current(&self, stack: &StackName) -> Option<Operation> {
        self.entries.lock().get(stack).map(|e| e.operation)
    }

    /// When the current operation on `stack` started.
    pub fn started_at(&self, stack: &StackName) -> Option<DateTime<Utc>> {
        self.entries.lock().get(stack).map(|e| e.acquired_at)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn release(&self, stack: &StackName, token: Uuid) {
        let mut entries = self.entries.lock();
        // Only the holder may release.
        if entries.get(stack).map(|e| e.token) == Some(token) {
            entries.remove(stack);
            debug!(stack = %stack, "Released in-flight token");
        }
    }
}

/// Proof of ownership of a stack's in-flight slot.
#[derive(Debug)]
pub struct InFlightToken {
    registry: Arc<InFlightRegistry>,
    stack: StackName,
    token: Uuid,
}

impl InFlightToken {
    pub fn stack(&self) -> &StackName {
        &self.stack
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.registry.release(&self.stack, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicting_acquire_fails() {
        let registry = InFlightRegistry::new();
        let name = StackName::new("s");

        let token = registry.acquire(&name, Operation::Create).unwrap();
        let err = registry.acquire(&name, Operation::Delete).unwrap_err();
        assert!(matches!(err, StackError::InProgress { ref operation, .. } if operation == "create"));
        assert_eq!(registry.current(&name), Some(Operation::Create));

        drop(token);
        assert!(registry.is_empty());
        assert!(registry.acquire(&name, Operation::Delete).is_ok());
    }

    #[test]
    fn test_distinct_stacks_do_not_conflict() {
        let registry = InFlightRegistry::new();
        let _a = registry.acquire(&"a".into(), Operation::Create).unwrap();
        let _b = registry.acquire(&"b".into(), Operation::Create).unwrap();
        assert_eq!(registry.len(), 2);
    }
}
