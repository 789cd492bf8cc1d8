//! Delta Chat transport - drives `deltachat-rpc-server` over stdio JSON-RPC.
//!
//! The server delivers core events through `getNextEvent` and exposes the
//! account/message API as camelCase JSON-RPC methods. One request is in
//! flight at a time; the event loop is strictly sequential.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use crate::completion;
use crate::config::Config;
use crate::handler::{self, ChatTransport, IncomingMessage, SendError};

const RPC_SERVER_BIN: &str = "deltachat-rpc-server";
const DEFAULT_ACCOUNTS_DIR: &str = "accounts";

#[derive(Debug)]
pub enum RpcError {
    /// Could not start the rpc server binary.
    Spawn(std::io::Error),
    /// Reading or writing the server's stdio failed.
    Io(std::io::Error),
    /// The server closed its stdout.
    Disconnected,
    /// A line from the server was not valid JSON-RPC.
    Decode(serde_json::Error),
    /// The server answered with a JSON-RPC error object.
    Remote { method: String, code: i64, message: String },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn {RPC_SERVER_BIN}: {e}"),
            Self::Io(e) => write!(f, "rpc i/o error: {e}"),
            Self::Disconnected => write!(f, "{RPC_SERVER_BIN} closed the connection"),
            Self::Decode(e) => write!(f, "invalid rpc payload: {e}"),
            Self::Remote { method, code, message } => {
                write!(f, "rpc call {method} failed ({code}): {message}")
            }
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) | Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Core event envelope from `getNextEvent`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventEnvelope {
    context_id: u32,
    event: Event,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum Event {
    #[serde(rename_all = "camelCase")]
    IncomingMsg { chat_id: u32, msg_id: u32 },
    #[serde(other)]
    Other,
}

/// The slice of the message snapshot this bot needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageSnapshot {
    #[serde(default)]
    text: String,
    sender: ContactSnapshot,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactSnapshot {
    address: String,
    name_and_addr: String,
}

/// Client for a `deltachat-rpc-server` child process.
pub struct DeltaChat {
    _child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl DeltaChat {
    /// Spawn the rpc server. Accounts live in `DC_ACCOUNTS_PATH`
    /// (default `./accounts`).
    pub fn spawn() -> Result<Self, RpcError> {
        let accounts_dir = std::env::var("DC_ACCOUNTS_PATH")
            .unwrap_or_else(|_| DEFAULT_ACCOUNTS_DIR.to_string());

        let mut child = Command::new(RPC_SERVER_BIN)
            .env("DC_ACCOUNTS_PATH", &accounts_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RpcError::Spawn)?;

        let stdin = child.stdin.take().ok_or(RpcError::Disconnected)?;
        let stdout = child.stdout.take().ok_or(RpcError::Disconnected)?;

        info!("Started {RPC_SERVER_BIN} (accounts dir: {accounts_dir})");
        Ok(Self {
            _child: child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            next_id: 0,
        })
    }

    /// One JSON-RPC round-trip. Lines that are not the awaited response
    /// (notifications, stale ids) are skipped.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.next_id += 1;
        let id = self.next_id;

        let request = Request { jsonrpc: "2.0", id, method, params };
        let mut line = serde_json::to_string(&request).map_err(RpcError::Decode)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(RpcError::Io)?;

        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(RpcError::Io)?
                .ok_or(RpcError::Disconnected)?;
            let response: Response = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping undecodable rpc line: {e}");
                    continue;
                }
            };
            if response.id != Some(id) {
                continue;
            }
            if let Some(err) = response.error {
                return Err(RpcError::Remote {
                    method: method.to_string(),
                    code: err.code,
                    message: err.message,
                });
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    pub async fn account_ids(&mut self) -> Result<Vec<u32>, RpcError> {
        let result = self.call("getAllAccountIds", json!([])).await?;
        serde_json::from_value(result).map_err(RpcError::Decode)
    }

    /// Create and configure a new account (the `init` subcommand).
    pub async fn provision_account(
        &mut self,
        addr: &str,
        password: &str,
    ) -> Result<u32, RpcError> {
        let result = self.call("addAccount", json!([])).await?;
        let account_id: u32 = serde_json::from_value(result).map_err(RpcError::Decode)?;

        self.call("setConfig", json!([account_id, "addr", addr])).await?;
        self.call("setConfig", json!([account_id, "mail_pw", password])).await?;
        info!("Configuring account {account_id} ({addr})...");
        self.call("configure", json!([account_id])).await?;
        Ok(account_id)
    }

    /// Event loop: pull core events forever and hand incoming messages to
    /// the handler. Per-event failures are logged and the loop keeps
    /// running; only a dead rpc connection is fatal.
    pub async fn serve(&mut self, config: &Config, ai: &completion::Client) -> Result<(), RpcError> {
        let accounts = self.account_ids().await?;
        if accounts.is_empty() {
            warn!("No accounts configured - run `aibot init <addr> <password>` first");
        }
        self.call("startIoForAllAccounts", json!([])).await?;
        info!("Listening for messages on {} account(s)", accounts.len());

        loop {
            let raw = self.call("getNextEvent", json!([])).await?;
            let envelope: EventEnvelope = match serde_json::from_value(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Ignoring undecodable event: {e}");
                    continue;
                }
            };

            let Event::IncomingMsg { chat_id, msg_id } = envelope.event else {
                continue;
            };
            let account_id = envelope.context_id;

            let msg = match self.fetch_message(account_id, chat_id, msg_id).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Failed to fetch message {msg_id} in chat {chat_id}: {e}");
                    continue;
                }
            };
            handler::handle_message(config, ai, self, &msg).await;
        }
    }

    async fn fetch_message(
        &mut self,
        account_id: u32,
        chat_id: u32,
        msg_id: u32,
    ) -> Result<IncomingMessage, RpcError> {
        let result = self.call("getMessage", json!([account_id, msg_id])).await?;
        let snapshot: MessageSnapshot =
            serde_json::from_value(result).map_err(RpcError::Decode)?;

        Ok(IncomingMessage {
            account_id,
            chat_id,
            sender_address: snapshot.sender.address,
            sender: snapshot.sender.name_and_addr,
            text: snapshot.text,
        })
    }
}

impl ChatTransport for DeltaChat {
    async fn send_text(
        &mut self,
        account_id: u32,
        chat_id: u32,
        text: &str,
    ) -> Result<(), SendError> {
        self.call("sendMsg", json!([account_id, chat_id, { "text": text }]))
            .await
            .map(|_| ())
            .map_err(|e| SendError(e.to_string()))
    }
}
