//! Line-delimited JSON-RPC client for mail servers.
//!
//! One request per line, one response per line, over a raw TCP
//! socket. Requests carry `{id, method, params}`; responses carry
//! either `result` or `error`. A response whose `id` does not match
//! the request is logged and tolerated — servers are honored through
//! this protocol alone, and a wrong correlation id is not worth
//! dropping mail over.
//!
//! Server-side rejections surface as [`MailError::ServerError`] with
//! the server's error text, so callers can match the two sentinel
//! strings the protocol defines:
//!
//! - [`ERR_MESSAGE_ALREADY_STORED`] — the message is already there;
//!   the transmitter counts this as a success.
//! - [`ERR_TIMESTAMP_TOO_OLD`] — the server considers the message
//!   stale; the transmitter sends it back through proof-of-work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use chainmail_types::{Address, MailError, MessageId, Result, Timestamp};

use crate::message::Message;

// ---------------------------------------------------------------------------
// Sentinels
// ---------------------------------------------------------------------------

/// Server error meaning the message is already stored. Not a failure.
pub const ERR_MESSAGE_ALREADY_STORED: &str = "message_already_stored";

/// Server error meaning the message timestamp is too old; the message
/// must be re-mined with a fresh timestamp.
pub const ERR_TIMESTAMP_TOO_OLD: &str = "timestamp_too_old";

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

/// A JSON-RPC request line.
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    /// Correlation id echoed by the server.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Positional parameters.
    pub params: Vec<Value>,
}

/// A JSON-RPC response line.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    /// Correlation id; mismatches are warned about, not fatal.
    #[serde(default)]
    pub id: Option<Value>,
    /// Successful result, if any.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error object, if the server rejected the request.
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// The error object inside a response.
#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    /// Numeric error code, when the server provides one.
    #[serde(default)]
    pub code: Option<i64>,
    /// Human-readable (or sentinel) error text.
    pub message: String,
}

/// One inventory entry: when the server saw the message, and its id.
pub type InventoryEntry = (Timestamp, MessageId);

// ---------------------------------------------------------------------------
// MailServerClient
// ---------------------------------------------------------------------------

/// A connected mail server session.
pub struct MailServerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MailServerClient {
    /// Connects to a server endpoint (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`MailError::NetworkError`] if the TCP connection
    /// cannot be established.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| MailError::NetworkError {
                reason: format!("failed to connect to {endpoint}: {e}"),
            })?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Performs one request/response exchange.
    ///
    /// # Errors
    ///
    /// - [`MailError::NetworkError`] on I/O failure or a closed
    ///   connection.
    /// - [`MailError::ProtocolError`] if either line fails to
    ///   (de)serialize or the response carries neither result nor
    ///   error.
    /// - [`MailError::ServerError`] if the response carries an error
    ///   object.
    pub async fn call(&mut self, id: u64, method: &str, params: Vec<Value>) -> Result<Value> {
        let request = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&request).map_err(|e| MailError::ProtocolError {
            reason: format!("failed to encode {method} request: {e}"),
        })?;
        line.push('\n');

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MailError::NetworkError {
                reason: format!("failed to send {method} request: {e}"),
            })?;

        let mut raw_response = String::new();
        let n = self
            .reader
            .read_line(&mut raw_response)
            .await
            .map_err(|e| MailError::NetworkError {
                reason: format!("failed to read {method} response: {e}"),
            })?;
        if n == 0 {
            return Err(MailError::NetworkError {
                reason: format!("connection closed while awaiting {method} response"),
            });
        }

        let response: RpcResponse =
            serde_json::from_str(&raw_response).map_err(|e| MailError::ProtocolError {
                reason: format!("malformed {method} response: {e}"),
            })?;

        if response.id != Some(Value::from(id)) {
            tracing::warn!(
                expected = id,
                got = ?response.id,
                method,
                "server response has wrong id, pressing on",
            );
        }

        if let Some(error) = response.error {
            return Err(MailError::ServerError {
                reason: error.message,
            });
        }

        response.result.ok_or_else(|| MailError::ProtocolError {
            reason: format!("{method} response carried neither result nor error"),
        })
    }

    /// Stores a message on the server.
    pub async fn store_message(&mut self, message: &Message) -> Result<()> {
        let param = serde_json::to_value(message).map_err(|e| MailError::ProtocolError {
            reason: format!("failed to encode message: {e}"),
        })?;
        self.call(0, "mail_store_message", vec![param]).await?;
        Ok(())
    }

    /// Fetches a stored message by id.
    pub async fn fetch_message(&mut self, id: MessageId) -> Result<Message> {
        let param = serde_json::to_value(id).map_err(|e| MailError::ProtocolError {
            reason: format!("failed to encode message id: {e}"),
        })?;
        let result = self.call(1, "mail_fetch_message", vec![param]).await?;
        serde_json::from_value(result).map_err(|e| MailError::ProtocolError {
            reason: format!("malformed message in mail_fetch_message response: {e}"),
        })
    }

    /// Fetches up to `limit` inventory entries addressed to `recipient`
    /// since `since`. A result shorter than `limit` signals
    /// end-of-stream.
    pub async fn fetch_inventory(
        &mut self,
        recipient: Address,
        since: Timestamp,
        limit: usize,
    ) -> Result<Vec<InventoryEntry>> {
        let params = vec![
            serde_json::to_value(recipient).map_err(|e| MailError::ProtocolError {
                reason: format!("failed to encode recipient address: {e}"),
            })?,
            Value::from(since.as_secs()),
            Value::from(limit as u64),
        ];
        let result = self.call(0, "mail_fetch_inventory", params).await?;
        serde_json::from_value(result).map_err(|e| MailError::ProtocolError {
            reason: format!("malformed inventory in mail_fetch_inventory response: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
