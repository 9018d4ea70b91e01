use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use super::wire::{read_frame, write_frame, Address, Message, Payload};
use crate::error::SwarmResult;

pub type HandlerResult = SwarmResult<serde_json::Value>;
pub type HandlerFn =
    Arc<dyn Fn(Payload) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

struct DispatchRequest {
    message: Message,
    reply_tx: oneshot::Sender<Message>,
}

/// A single-listener request/reply server. Every accepted connection gets
/// its own read/write loop, but all handler invocations funnel through one
/// dispatch task so mutations to shared state (the pending-configs list,
/// the assignment map, the satellite set) are naturally serialized without
/// a lock, matching §5's "mutated only inside bus handlers" invariant.
pub struct BusServer {
    handlers: HashMap<String, HandlerFn>,
    client_registry: Arc<Mutex<HashMap<String, u64>>>,
}

impl Default for BusServer {
    fn default() -> Self {
        Self::new()
    }
}

impl BusServer {
    pub fn new() -> Self {
        let mut server = BusServer {
            handlers: HashMap::new(),
            client_registry: Arc::new(Mutex::new(HashMap::new())),
        };
        server.register_builtin_handlers();
        server
    }

    /// Shared handle to the register/unregister refcounts, so the Overmind
    /// can poll "is any satellite still registered?" during shutdown.
    pub fn client_registry(&self) -> Arc<Mutex<HashMap<String, u64>>> {
        self.client_registry.clone()
    }

    pub fn register_callback<F, Fut>(&mut self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let message_type = message_type.into();
        self.handlers
            .insert(message_type, Arc::new(move |payload| Box::pin(handler(payload))));
    }

    fn register_builtin_handlers(&mut self) {
        let registry = self.client_registry.clone();
        self.register_callback("register", move |payload| {
            let registry = registry.clone();
            async move {
                let mut counts = registry.lock().await;
                *counts.entry(payload.client_id).or_insert(0) += 1;
                Ok(serde_json::json!({ "registered": "ok" }))
            }
        });

        let registry = self.client_registry.clone();
        self.register_callback("unregister", move |payload| {
            let registry = registry.clone();
            async move {
                let mut counts = registry.lock().await;
                if let Some(count) = counts.get_mut(&payload.client_id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        counts.remove(&payload.client_id);
                    }
                }
                Ok(serde_json::json!({ "unregistered": "ok" }))
            }
        });
    }

    /// Binds the listener and returns the fully-qualified address (the
    /// requested port resolved to whatever the OS handed out) together with
    /// a future that serves connections until it is dropped or errors.
    pub async fn bind(
        self,
        address: &str,
    ) -> SwarmResult<(String, impl Future<Output = SwarmResult<()>>)> {
        let parsed = Address::parse(address)?;
        let listener = TcpListener::bind(parsed.socket_addr_string()).await?;
        let bound_port = listener.local_addr()?.port();
        let qualified = Address { host: parsed.host, port: bound_port }.qualified();

        Ok((qualified, self.serve(listener)))
    }

    async fn serve(self, listener: TcpListener) -> SwarmResult<()> {
        let handlers = Arc::new(self.handlers);
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<DispatchRequest>();

        let dispatch_handlers = handlers.clone();
        tokio::spawn(async move {
            while let Some(req) = dispatch_rx.recv().await {
                let reply = Self::dispatch(&dispatch_handlers, req.message).await;
                let _ = req.reply_tx.send(reply);
            }
        });

        loop {
            let (stream, _) = listener.accept().await?;
            let dispatch_tx = dispatch_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = Self::handle_connection(stream, dispatch_tx).await {
                    debug!("bus connection closed: {err}");
                }
            });
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        dispatch_tx: mpsc::UnboundedSender<DispatchRequest>,
    ) -> SwarmResult<()> {
        loop {
            let message = match read_frame(&mut stream).await {
                Ok(message) => message,
                Err(_) => return Ok(()), // client disconnected or sent garbage
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if dispatch_tx.send(DispatchRequest { message, reply_tx }).is_err() {
                return Ok(());
            }
            let Ok(reply) = reply_rx.await else {
                return Ok(());
            };
            write_frame(&mut stream, &reply).await?;
        }
    }

    async fn dispatch(handlers: &HashMap<String, HandlerFn>, message: Message) -> Message {
        let client_id = message.payload.client_id.clone();

        let Some(message_type) = message.message_type.clone() else {
            return Message::untyped_error(client_id, "request missing message_type");
        };

        let Some(handler) = handlers.get(&message_type) else {
            return Message::new(
                "error",
                client_id,
                serde_json::json!({ "error": "invalid message type" }),
            );
        };

        match handler(message.payload).await {
            Ok(data) => Message::new(format!("{message_type}_reply"), client_id, data),
            Err(err) => Message::untyped_error(client_id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusClient;

    #[tokio::test]
    async fn register_and_custom_handler_round_trip() {
        let mut server = BusServer::new();
        server.register_callback("echo", |payload| async move { Ok(payload.data) });

        let (address, serve) = server.bind("127.0.0.1:0").await.unwrap();
        tokio::spawn(serve);

        let client = BusClient::connect(&address).await.unwrap();
        client.session_register().await;

        let reply = client
            .call("echo", serde_json::json!({ "hello": "world" }))
            .await
            .expect("echo should reply");
        assert_eq!(reply["hello"], "world");

        client.session_unregister().await;
    }

    #[tokio::test]
    async fn unknown_message_type_gets_error_reply() {
        let server = BusServer::new();
        let (address, serve) = server.bind("127.0.0.1:0").await.unwrap();
        tokio::spawn(serve);

        let client = BusClient::connect(&address).await.unwrap();
        let reply = client.call("no_such_type", serde_json::json!({})).await;
        // The server replies with an "error" message; our client still
        // hands back the payload, which carries the error string.
        assert!(reply.is_some());
        assert_eq!(reply.unwrap()["error"], "invalid message type");
    }

    #[tokio::test]
    async fn handler_panic_path_reports_error_without_type() {
        let mut server = BusServer::new();
        server.register_callback("boom", |_payload| async move {
            Err(crate::error::SwarmError::Other(anyhow::anyhow!("kaboom")))
        });
        let (address, serve) = server.bind("127.0.0.1:0").await.unwrap();
        tokio::spawn(serve);

        let client = BusClient::connect(&address).await.unwrap();
        let reply = client.call("boom", serde_json::json!({})).await.unwrap();
        assert!(reply["error"].as_str().unwrap().contains("kaboom"));
    }
}
