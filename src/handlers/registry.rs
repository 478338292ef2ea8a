//! Compile-time handler registry: handler type tag to factory.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{HandlerError, JobError};
use crate::handlers::{CommandHandler, CurlHandler, Handler, ShellKind};
use crate::timeline::{HandlerType, TimelineHandler};

/// Builds a handler instance for one timeline handler definition.
pub type HandlerFactory =
    Arc<dyn Fn(&TimelineHandler) -> Result<Arc<dyn Handler>, HandlerError> + Send + Sync>;

/// Registry of handler factories. Populated at startup and read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<HandlerType, HandlerFactory>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(HandlerType::Command, |_| {
            Ok(Arc::new(CommandHandler::new(ShellKind::Platform)) as Arc<dyn Handler>)
        });
        registry.register(HandlerType::Bash, |_| {
            Ok(Arc::new(CommandHandler::new(ShellKind::Bash)) as Arc<dyn Handler>)
        });
        registry.register(HandlerType::Curl, |_| {
            Ok(Arc::new(CurlHandler::new()?) as Arc<dyn Handler>)
        });
        registry
    }

    /// Register a factory, replacing any previous one for the same type.
    pub fn register<F>(&mut self, handler_type: HandlerType, factory: F)
    where
        F: Fn(&TimelineHandler) -> Result<Arc<dyn Handler>, HandlerError> + Send + Sync + 'static,
    {
        tracing::debug!("Registered handler: {}", handler_type);
        self.factories.insert(handler_type, Arc::new(factory));
    }

    /// Check if a handler type can be launched.
    pub fn has(&self, handler_type: &HandlerType) -> bool {
        self.factories.contains_key(handler_type)
    }

    /// List registered handler types.
    pub fn list(&self) -> Vec<HandlerType> {
        self.factories.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.factories.len()
    }

    /// Construct the handler for `definition`. Unknown types are a launch error.
    pub fn create(&self, definition: &TimelineHandler) -> Result<Arc<dyn Handler>, JobError> {
        let handler_type = &definition.handler_type;
        let factory = self
            .factories
            .get(handler_type)
            .ok_or_else(|| JobError::UnknownHandler {
                handler_type: handler_type.to_string(),
            })?;

        factory(definition).map_err(|e| JobError::Construction {
            handler_type: handler_type.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.count(), 3);
        assert!(registry.has(&HandlerType::Command));
        assert!(registry.has(&HandlerType::Bash));
        assert!(registry.has(&HandlerType::Curl));
    }

    #[test]
    fn unknown_type_is_launch_error() {
        let registry = HandlerRegistry::with_builtins();
        let definition = TimelineHandler::new(HandlerType::Other("Teleport".into()));
        let err = registry.create(&definition).err().unwrap();
        assert!(matches!(
            err,
            JobError::UnknownHandler { ref handler_type } if handler_type == "Teleport"
        ));
    }

    #[test]
    fn constructor_failure_is_reported() {
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerType::Word, |_| {
            Err(HandlerError::ExecutionFailed("no office suite".into()))
        });
        let err = registry
            .create(&TimelineHandler::new(HandlerType::Word))
            .err()
            .unwrap();
        assert!(matches!(err, JobError::Construction { .. }));
    }
}
