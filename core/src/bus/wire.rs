use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SwarmError, SwarmResult};

/// `{"message_type": "...", "payload": {"client_id": "...", "data": {...}}}`.
/// The payload shape is deliberately uniform — `{client_id, data}` — rather
/// than sometimes carrying bare fields, per the spec's redesign note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Absent only on the handler-exception reply shape (§4.2): the spec
    /// calls for a bare `{client_id, error}` payload with no type field in
    /// that one case, so callers must treat this as optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    pub client_id: String,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn new(message_type: impl Into<String>, client_id: impl Into<String>, data: Value) -> Self {
        Message {
            message_type: Some(message_type.into()),
            payload: Payload { client_id: client_id.into(), data },
        }
    }

    /// Builds the no-type-field reply shape used when a server handler
    /// raised an exception.
    pub fn untyped_error(client_id: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Message {
            message_type: None,
            payload: Payload {
                client_id: client_id.into(),
                data: serde_json::json!({ "error": error.to_string() }),
            },
        }
    }

    pub fn reply_type(&self) -> Option<String> {
        self.message_type.as_ref().map(|t| format!("{t}_reply"))
    }
}

/// A parsed bus endpoint. `server_address` becomes fully qualified (scheme
/// and a concrete port) only after [`crate::bus::BusServer::bind`] resolves
/// port 0 to whatever the OS handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parses `tcp://host:port` or a bare `host[:port]`. A missing or zero
    /// port means "bind to any free port"; the protocol defaults to `tcp`
    /// (the only transport this bus speaks).
    pub fn parse(raw: &str) -> SwarmResult<Address> {
        let without_scheme = raw.strip_prefix("tcp://").unwrap_or(raw);
        match without_scheme.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| SwarmError::InvalidAddress(raw.to_string()))?;
                Ok(Address { host: host.to_string(), port })
            }
            None => Ok(Address { host: without_scheme.to_string(), port: 0 }),
        }
    }

    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn qualified(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> SwarmResult<()> {
    let body = serde_json::to_vec(message)?;
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> SwarmResult<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_scheme_and_port() {
        let addr = Address::parse("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 9000);
    }

    #[test]
    fn bare_host_defaults_to_tcp_and_any_port() {
        let addr = Address::parse("127.0.0.1").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 0);
        assert_eq!(addr.qualified(), "tcp://127.0.0.1:0");
    }

    #[test]
    fn reply_type_appends_suffix() {
        let msg = Message::new("stats", "c1", serde_json::json!({}));
        assert_eq!(msg.reply_type().as_deref(), Some("stats_reply"));
    }

    #[test]
    fn untyped_error_has_no_message_type() {
        let msg = Message::untyped_error("c1", "boom");
        assert!(msg.message_type.is_none());
        assert_eq!(msg.payload.data["error"], "boom");
        let bytes = serde_json::to_vec(&msg).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("message_type").is_none());
    }
}
