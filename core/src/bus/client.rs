use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::wire::{read_frame, write_frame, Message};
use crate::error::SwarmResult;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

static CLIENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One dedicated connection to a [`crate::bus::BusServer`]. `call` is
/// best-effort: a transport failure or a timed-out reply yields `None`
/// rather than an error, matching the spec's "never raises on transport
/// failure" guarantee — callers that need a result retry at a higher level.
pub struct BusClient {
    client_id: String,
    stream: Mutex<TcpStream>,
}

impl BusClient {
    pub async fn connect(address: &str) -> SwarmResult<Self> {
        let parsed = super::wire::Address::parse(address)?;
        let stream = TcpStream::connect(parsed.socket_addr_string()).await?;
        Ok(BusClient { client_id: generate_client_id(), stream: Mutex::new(stream) })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends one request and waits up to [`CALL_TIMEOUT`] for the matching
    /// reply. The single connection is held for the whole round trip, so
    /// concurrent calls from the same client are serialized rather than
    /// interleaved on the wire.
    pub async fn call(&self, message_type: impl Into<String>, data: Value) -> Option<Value> {
        let request = Message::new(message_type, self.client_id.clone(), data);
        let mut stream = self.stream.lock().await;

        let roundtrip = async {
            write_frame(&mut *stream, &request).await?;
            read_frame(&mut *stream).await
        };

        match tokio::time::timeout(CALL_TIMEOUT, roundtrip).await {
            Ok(Ok(reply)) => Some(reply.payload.data),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Announces this client to the server's refcount registry. Entering a
    /// session this way is how a colony or satellite marks itself "alive"
    /// for the duration it holds the connection open.
    pub async fn session_register(&self) {
        self.call("register", serde_json::json!({})).await;
    }

    /// Leaves the session, decrementing the server's refcount for this
    /// client id. Always attempted even if earlier calls on this client
    /// failed, since it is itself best-effort.
    pub async fn session_unregister(&self) {
        self.call("unregister", serde_json::json!({})).await;
    }
}

fn generate_client_id() -> String {
    let pid = std::process::id();
    let sequence = CLIENT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("client-{pid}-{sequence}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusServer;

    #[tokio::test]
    async fn call_times_out_as_none_when_server_never_replies() {
        // A bare TCP echo-less listener that accepts and then does nothing:
        // simulates a wedged server, and a client should not hang forever.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
            std::future::pending::<()>().await;
        });

        let client = BusClient::connect(&format!("127.0.0.1:{}", addr.port())).await.unwrap();
        // Use a tiny sub-scope by temporarily racing against a short sleep
        // instead of waiting the full 10s in a unit test.
        let result = tokio::time::timeout(Duration::from_millis(200), client.call("ping", serde_json::json!({})));
        assert!(result.await.is_err(), "call should still be pending, proving it didn't error out early");
    }

    #[tokio::test]
    async fn client_ids_are_stable_and_unique_per_instance() {
        let server = BusServer::new();
        let (address, serve) = server.bind("127.0.0.1:0").await.unwrap();
        tokio::spawn(serve);

        let a = BusClient::connect(&address).await.unwrap();
        let b = BusClient::connect(&address).await.unwrap();
        assert_ne!(a.client_id(), b.client_id());
        assert_eq!(a.client_id(), a.client_id());
    }
}
