//! stdio Transport
//!
//! Line-delimited JSON-RPC over stdin/stdout. Logging goes to stderr so
//! stdout stays a clean protocol channel.

use std::io::{self, BufRead, BufReader, Write};

use tracing::{debug, error, warn};

use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::server::McpServer;

pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }

    /// Run the server until stdin closes.
    pub async fn run(self, server: McpServer) -> Result<(), io::Error> {
        let stdin = io::stdin();
        let stdout = io::stdout();

        let reader = BufReader::new(stdin.lock());
        let mut stdout = stdout.lock();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    error!("failed to read line: {}", e);
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            debug!("received {} bytes", line.len());

            let request: JsonRpcRequest = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("unparseable request: {}", e);
                    Self::send(&mut stdout, &JsonRpcResponse::error(
                        None,
                        JsonRpcError::parse_error(),
                    ))?;
                    continue;
                }
            };

            if let Some(response) = server.handle_request(request).await {
                Self::send(&mut stdout, &response)?;
            }
        }

        Ok(())
    }

    fn send(stdout: &mut impl Write, response: &JsonRpcResponse) -> Result<(), io::Error> {
        match serde_json::to_string(response) {
            Ok(raw) => {
                writeln!(stdout, "{}", raw)?;
                stdout.flush()?;
            }
            Err(e) => {
                error!("failed to serialize response: {}", e);
                // Minimal fallback so the client never hangs on a request
                let fallback = r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#;
                writeln!(stdout, "{}", fallback)?;
                stdout.flush()?;
            }
        }
        Ok(())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}
