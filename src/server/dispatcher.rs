//! Server-side request dispatch.
//!
//! [`ServerDispatcher::on_request`] turns one [`Request`] into exactly one
//! reply message. Built-in commands are answered first; everything else
//! goes through the [`CommandRegistry`], the [`Authorizer`], and the
//! handler timeout. The dispatcher keeps no per-request state, so a
//! repeated request id is simply processed again.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use super::context::RequestContext;
use super::event_bus::EventBus;
use super::registry::CommandRegistry;
use super::upload::UploadStore;
use crate::config::{CodecConfig, ServerConfig};
use crate::error::ServiceError;
use crate::protocol::builtin;
use crate::protocol::value::value_to_bytes;
use crate::protocol::{Message, Request, Response};

/// Decides whether a caller may run a command.
pub trait Authorizer: Send + Sync {
    /// Returns `true` if the caller holds every permission in
    /// `permissions`.
    fn is_authorized(&self, ctx: &RequestContext, permissions: &[String]) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&RequestContext, &[String]) -> bool + Send + Sync,
{
    fn is_authorized(&self, ctx: &RequestContext, permissions: &[String]) -> bool {
        self(ctx, permissions)
    }
}

/// Routes requests to handlers. Cheap to clone; every connection shares
/// one registry and one event bus.
#[derive(Clone)]
pub struct ServerDispatcher {
    registry: Arc<CommandRegistry>,
    authorizer: Option<Arc<dyn Authorizer>>,
    event_bus: EventBus,
    uploads: UploadStore,
    handler_timeout: Duration,
    codec: CodecConfig,
    outbound_capacity: usize,
    active_connections: Arc<AtomicUsize>,
}

impl fmt::Debug for ServerDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDispatcher")
            .field("commands", &self.registry.commands())
            .field("authorizer", &self.authorizer.is_some())
            .field("handler_timeout", &self.handler_timeout)
            .field("active_connections", &self.active_connections())
            .finish_non_exhaustive()
    }
}

impl ServerDispatcher {
    /// Creates a dispatcher over `registry` with limits from `config`.
    #[must_use]
    pub fn new(registry: CommandRegistry, config: &ServerConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            authorizer: None,
            event_bus: EventBus::new(config.codec),
            uploads: UploadStore::new(config.upload_dir.clone()),
            handler_timeout: config.handler_timeout,
            codec: config.codec,
            outbound_capacity: config.outbound_queue_capacity.max(1),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Installs the authorizer consulted for commands with permissions.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Handles one request and returns the reply.
    pub async fn on_request(&self, ctx: &RequestContext, request: Request) -> Message {
        let Request {
            id,
            command,
            params,
        } = request;
        let started = Instant::now();
        tracing::debug!(
            request_id = id,
            command = %command,
            connection_id = %ctx.connection_id,
            "request received"
        );

        let outcome = if builtin::is_builtin(&command) {
            self.run_builtin(ctx, &command, params).await
        } else {
            self.run_command(ctx, &command, params).await
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(body) => {
                tracing::debug!(request_id = id, command = %command, elapsed_ms, "request handled");
                Message::Response(Response {
                    request_id: id,
                    body,
                })
            }
            Err(err) => {
                match &err {
                    ServiceError::Handler { .. }
                    | ServiceError::Timeout { .. }
                    | ServiceError::Internal(_) => {
                        tracing::error!(request_id = id, command = %command, elapsed_ms, error = %err, "request failed");
                    }
                    _ => {
                        tracing::warn!(request_id = id, command = %command, error = %err, "request rejected");
                    }
                }
                Message::Error(err.to_error_response(id))
            }
        }
    }

    async fn run_command(
        &self,
        ctx: &RequestContext,
        command: &str,
        params: Vec<Value>,
    ) -> Result<Value, ServiceError> {
        let Some(descriptor) = self.registry.get(command) else {
            return Err(ServiceError::CommandNotFound(command.to_string()));
        };
        self.authorize(ctx, command, &descriptor.permissions)?;

        let handler = Arc::clone(&descriptor.handler);
        match tokio::time::timeout(self.handler_timeout, handler.handle(ctx, params)).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(err)) => Err(ServiceError::Handler {
                message: err.to_string(),
                stack: format!("{err:?}"),
            }),
            Err(_elapsed) => Err(ServiceError::Timeout {
                command: command.to_string(),
                timeout_ms: u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    fn authorize(
        &self,
        ctx: &RequestContext,
        command: &str,
        permissions: &[String],
    ) -> Result<(), ServiceError> {
        if permissions.is_empty() {
            return Ok(());
        }
        match &self.authorizer {
            Some(authorizer) if authorizer.is_authorized(ctx, permissions) => Ok(()),
            Some(_) => Err(ServiceError::Authorization(format!(
                "'{command}' requires {}",
                permissions.join(", ")
            ))),
            None => Err(ServiceError::Authorization(format!(
                "'{command}' requires permissions but no authorizer is configured"
            ))),
        }
    }

    async fn run_builtin(
        &self,
        ctx: &RequestContext,
        command: &str,
        params: Vec<Value>,
    ) -> Result<Value, ServiceError> {
        match command {
            builtin::ADD_EVENT_LISTENER => {
                let event_name = str_param(&params, 0, "eventName")?;
                let info = params.get(1).cloned().unwrap_or(Value::Null);
                let id = self
                    .event_bus
                    .add(ctx.connection_id, ctx.outbound.clone(), event_name, info)
                    .await
                    .ok_or(ServiceError::ConnectionLost)?;
                Ok(json!(id))
            }
            builtin::REMOVE_EVENT_LISTENER => {
                let listener_id = u32_param(&params, 0, "listenerId")?;
                self.event_bus
                    .remove_owned(ctx.connection_id, listener_id)
                    .await;
                Ok(Value::Null)
            }
            builtin::GET_EVENT_LISTENERS => {
                let event_name = str_param(&params, 0, "eventName")?;
                let listeners = self.event_bus.listeners_for(event_name).await;
                serde_json::to_value(listeners).map_err(|e| ServiceError::Internal(e.to_string()))
            }
            builtin::EMIT_EVENT => {
                let ids: Vec<u32> = params
                    .first()
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .ok_or_else(|| {
                        ServiceError::InvalidParams("listenerIds must be an array of ids".into())
                    })?;
                let data = params.get(1).cloned().unwrap_or(Value::Null);
                let delivered = self.event_bus.emit_to(&ids, &data).await;
                tracing::debug!(requested = ids.len(), delivered, "event emitted");
                Ok(Value::Null)
            }
            builtin::UPLOAD => {
                let filename = str_param(&params, 0, "filename")?;
                let bytes = params.get(1).and_then(value_to_bytes).ok_or_else(|| {
                    ServiceError::InvalidParams("buffer must be a binary value".into())
                })?;
                let result = self.uploads.save(filename, &bytes).await?;
                serde_json::to_value(result).map_err(|e| ServiceError::Internal(e.to_string()))
            }
            other => Err(ServiceError::CommandNotFound(other.to_string())),
        }
    }

    /// Shared listener table.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Registered commands.
    #[must_use]
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Codec limits used for every connection.
    #[must_use]
    pub fn codec(&self) -> CodecConfig {
        self.codec
    }

    /// Capacity of each connection's outbound queue.
    #[must_use]
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    /// Number of open connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Counts a connection as open until the returned guard drops.
    pub(crate) fn track_connection(&self) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard(Arc::clone(&self.active_connections))
    }
}

/// Decrements the open-connection count on drop.
#[derive(Debug)]
pub(crate) struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, ServiceError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::InvalidParams(format!("{name} must be a string")))
}

fn u32_param(params: &[Value], index: usize, name: &str) -> Result<u32, ServiceError> {
    params
        .get(index)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ServiceError::InvalidParams(format!("{name} must be an unsigned integer")))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::value::bytes_to_value;
    use crate::server::context::ConnectionId;
    use crate::server::registry::CommandHandler;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, _ctx: &RequestContext, params: Vec<Value>) -> anyhow::Result<Value> {
            Ok(params.into_iter().next().unwrap_or(Value::Null))
        }
    }

    struct Failing;

    #[async_trait]
    impl CommandHandler for Failing {
        async fn handle(&self, _ctx: &RequestContext, _params: Vec<Value>) -> anyhow::Result<Value> {
            let cause = anyhow::anyhow!("disk full");
            Err(cause.context("save failed"))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl CommandHandler for Sleepy {
        async fn handle(&self, _ctx: &RequestContext, _params: Vec<Value>) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    fn dispatcher(config: &ServerConfig) -> ServerDispatcher {
        let mut registry = CommandRegistry::new();
        registry.register("echo", Echo);
        registry.register("fail", Failing);
        registry.register("sleep", Sleepy);
        registry.register_with_permissions("admin.reset", &["admin"], Echo);
        ServerDispatcher::new(registry, config)
    }

    fn ctx() -> (RequestContext, mpsc::Receiver<crate::protocol::Encoded>) {
        let (tx, rx) = mpsc::channel(8);
        (RequestContext::new(ConnectionId::new(), None, tx), rx)
    }

    fn request(id: u32, command: &str, params: Vec<Value>) -> Request {
        Request {
            id,
            command: command.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn handler_value_becomes_response_body() {
        let d = dispatcher(&ServerConfig::default());
        let (ctx, _rx) = ctx();
        let reply = d.on_request(&ctx, request(1, "echo", vec![json!("hi")])).await;
        assert_eq!(
            reply,
            Message::Response(Response {
                request_id: 1,
                body: json!("hi")
            })
        );
    }

    #[tokio::test]
    async fn unknown_command_is_error() {
        let d = dispatcher(&ServerConfig::default());
        let (ctx, _rx) = ctx();
        let Message::Error(err) = d.on_request(&ctx, request(1, "nope", vec![])).await else {
            panic!("expected error");
        };
        assert_eq!(err.request_id, 1);
        assert_eq!(err.message, "command not found: nope");
        assert_eq!(err.code, "COMMAND_NOT_FOUND");
    }

    #[tokio::test]
    async fn handler_error_carries_message_and_chain() {
        let d = dispatcher(&ServerConfig::default());
        let (ctx, _rx) = ctx();
        let Message::Error(err) = d.on_request(&ctx, request(4, "fail", vec![])).await else {
            panic!("expected error");
        };
        assert_eq!(err.message, "save failed");
        assert!(err.stack.contains("disk full"));
        assert_eq!(err.code, "HANDLER_ERROR");
    }

    #[tokio::test]
    async fn permissions_without_authorizer_are_denied() {
        let d = dispatcher(&ServerConfig::default());
        let (ctx, _rx) = ctx();
        let Message::Error(err) = d.on_request(&ctx, request(2, "admin.reset", vec![])).await
        else {
            panic!("expected error");
        };
        assert_eq!(err.code, "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn authorizer_decides() {
        let allow = dispatcher(&ServerConfig::default()).with_authorizer(
            |_ctx: &RequestContext, perms: &[String]| perms.iter().all(|p| p == "admin"),
        );
        let deny = dispatcher(&ServerConfig::default())
            .with_authorizer(|_ctx: &RequestContext, _perms: &[String]| false);
        let (ctx, _rx) = ctx();
        assert!(matches!(
            allow.on_request(&ctx, request(1, "admin.reset", vec![json!(1)])).await,
            Message::Response(_)
        ));
        assert!(matches!(
            deny.on_request(&ctx, request(2, "admin.reset", vec![])).await,
            Message::Error(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let config = ServerConfig {
            handler_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        let d = dispatcher(&config);
        let (ctx, _rx) = ctx();
        let Message::Error(err) = d.on_request(&ctx, request(9, "sleep", vec![])).await else {
            panic!("expected error");
        };
        assert_eq!(err.code, "TIMEOUT");
    }

    #[tokio::test]
    async fn listener_builtins_round_trip() {
        let d = dispatcher(&ServerConfig::default());
        let (ctx, mut rx) = ctx();
        let Message::Response(added) = d
            .on_request(
                &ctx,
                request(1, builtin::ADD_EVENT_LISTENER, vec![json!("tick"), json!({"room": 1})]),
            )
            .await
        else {
            panic!("expected response");
        };
        let Message::Response(listed) = d
            .on_request(&ctx, request(2, builtin::GET_EVENT_LISTENERS, vec![json!("tick")]))
            .await
        else {
            panic!("expected response");
        };
        assert_eq!(listed.body, json!([{"id": added.body, "info": {"room": 1}}]));

        let emitted = d
            .on_request(
                &ctx,
                request(3, builtin::EMIT_EVENT, vec![json!([added.body]), json!("go")]),
            )
            .await;
        assert!(matches!(emitted, Message::Response(_)));
        assert!(rx.recv().await.is_some());

        let removed = d
            .on_request(&ctx, request(4, builtin::REMOVE_EVENT_LISTENER, vec![added.body]))
            .await;
        assert!(matches!(removed, Message::Response(_)));
        assert!(d.event_bus().is_empty().await);
    }

    #[tokio::test]
    async fn listener_removal_is_limited_to_its_connection() {
        let d = dispatcher(&ServerConfig::default());
        let (owner, _owner_rx) = ctx();
        let (intruder, _intruder_rx) = ctx();
        let Message::Response(added) = d
            .on_request(&owner, request(1, builtin::ADD_EVENT_LISTENER, vec![json!("tick")]))
            .await
        else {
            panic!("expected response");
        };

        let removed = d
            .on_request(
                &intruder,
                request(1, builtin::REMOVE_EVENT_LISTENER, vec![added.body.clone()]),
            )
            .await;
        assert!(matches!(removed, Message::Response(_)));
        assert_eq!(d.event_bus().len().await, 1);

        let removed = d
            .on_request(&owner, request(2, builtin::REMOVE_EVENT_LISTENER, vec![added.body]))
            .await;
        assert!(matches!(removed, Message::Response(_)));
        assert!(d.event_bus().is_empty().await);
    }

    #[tokio::test]
    async fn builtin_params_are_validated() {
        let d = dispatcher(&ServerConfig::default());
        let (ctx, _rx) = ctx();
        let Message::Error(err) = d
            .on_request(&ctx, request(1, builtin::ADD_EVENT_LISTENER, vec![json!(5)]))
            .await
        else {
            panic!("expected error");
        };
        assert_eq!(err.code, "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn upload_builtin_stores_file() {
        let Ok(dir) = tempfile::tempdir() else {
            panic!("tempdir failed");
        };
        let config = ServerConfig {
            upload_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let d = dispatcher(&config);
        let (ctx, _rx) = ctx();
        let params = vec![json!("a/b/data.bin"), bytes_to_value(&[9, 8, 7])];
        let Message::Response(res) = d.on_request(&ctx, request(1, builtin::UPLOAD, params)).await
        else {
            panic!("expected response");
        };
        assert_eq!(res.body.get("filename"), Some(&json!("data.bin")));
        assert_eq!(res.body.get("size"), Some(&json!(3)));
    }
}
