//! Explicitly injected map from logger id to logger.
//!
//! Workers refer to loggers by [`LoggerId`] over the pipe; the supervisor resolves the id
//! here. The registry holds weak references, so dropping a logger unregisters it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::log::JobLogger;

/// Identity of a logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoggerId(Uuid);

impl LoggerId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LoggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Weak id → logger map shared by a queue and its supervisors.
#[derive(Default)]
pub struct LoggerRegistry {
    loggers: RwLock<HashMap<LoggerId, Weak<dyn JobLogger>>>,
}

impl fmt::Debug for LoggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerRegistry")
            .field("loggers", &self.loggers.read().len())
            .finish()
    }
}

impl LoggerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `logger` under its own id and return that id.
    pub fn register(&self, logger: Arc<dyn JobLogger>) -> LoggerId {
        let id = logger.id();
        self.loggers.write().insert(id, Arc::downgrade(&logger));
        id
    }

    /// Remove the logger with `id`. Returns whether it was registered.
    pub fn unregister(&self, id: LoggerId) -> bool {
        self.loggers.write().remove(&id).is_some()
    }

    /// The live logger with `id`.
    pub fn get(&self, id: LoggerId) -> Option<Arc<dyn JobLogger>> {
        self.loggers.read().get(&id).and_then(Weak::upgrade)
    }

    /// Ids of every live logger. Dead entries are pruned.
    pub fn ids(&self) -> Vec<LoggerId> {
        let mut loggers = self.loggers.write();
        loggers.retain(|_, logger| logger.strong_count() > 0);
        loggers.keys().copied().collect()
    }

    /// Number of live loggers.
    pub fn len(&self) -> usize {
        self.ids().len()
    }

    /// Whether no live logger is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every logger.
    pub fn clear(&self) {
        self.loggers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Logger;

    #[test]
    fn test_dropped_logger_disappears() {
        let registry = LoggerRegistry::new();
        let logger = Arc::new(Logger::new());
        let id = registry.register(logger.clone());
        assert!(registry.get(id).is_some());
        assert_eq!(registry.ids(), vec![id]);

        drop(logger);
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }
}
