//! Command registry.
//!
//! Maps command names to handlers and the permissions a caller must hold
//! to invoke them. Built once at startup and shared immutably by every
//! connection.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::context::RequestContext;
use crate::protocol::builtin;

/// Trait implemented by every command handler.
///
/// The returned value becomes the response body. An error becomes an
/// error response whose `message` is the error's `Display` and whose
/// `stack` is its cause chain.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Runs the command.
    async fn handle(&self, ctx: &RequestContext, params: Vec<Value>) -> anyhow::Result<Value>;
}

/// Adapts an async closure to [`CommandHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(RequestContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, ctx: &RequestContext, params: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(ctx.clone(), params).await
    }
}

/// A registered command.
#[derive(Clone)]
pub struct CommandDescriptor {
    /// Handler invoked for the command.
    pub handler: Arc<dyn CommandHandler>,
    /// Permissions the caller must hold; empty means unrestricted.
    pub permissions: Vec<String>,
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

/// Registry mapping command names to descriptors.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandDescriptor>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an unrestricted handler.
    pub fn register(&mut self, command: &str, handler: impl CommandHandler + 'static) {
        self.register_with_permissions(command, &[], handler);
    }

    /// Registers a handler that requires `permissions`.
    pub fn register_with_permissions(
        &mut self,
        command: &str,
        permissions: &[&str],
        handler: impl CommandHandler + 'static,
    ) {
        if builtin::is_builtin(command) {
            tracing::warn!(command, "handler shadowed by built-in command");
        }
        let descriptor = CommandDescriptor {
            handler: Arc::new(handler),
            permissions: permissions.iter().map(ToString::to_string).collect(),
        };
        if self.commands.insert(command.to_owned(), descriptor).is_some() {
            tracing::warn!(command, "command handler replaced");
        }
    }

    /// Registers an async closure as an unrestricted handler.
    pub fn register_fn<F, Fut>(&mut self, command: &str, f: F)
    where
        F: Fn(RequestContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(command, FnHandler(f));
    }

    /// Looks up a command.
    #[must_use]
    pub fn get(&self, command: &str) -> Option<&CommandDescriptor> {
        self.commands.get(command)
    }

    /// Returns `true` if `command` is registered.
    #[must_use]
    pub fn contains(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    /// Registered command names, sorted.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
