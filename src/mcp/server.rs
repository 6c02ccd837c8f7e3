//! MCP stdio server
//!
//! Reads one JSON-RPC message per line and writes one response per line.
//! Requests are handled concurrently on a rayon scope, so a long network
//! scan does not hold up a quick lookup sent after it.

use super::error::McpError;
use super::protocol::*;
use super::tools;
use crate::database::DatabaseManager;
use crate::iterator::IteratorManager;
use crate::updater::Updater;
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

/// Default page size for `lookup_network`
pub const DEFAULT_MAX_RESULTS: usize = 1000;

/// Server state shared by every request
pub struct McpServer {
    pub(super) manager: Arc<DatabaseManager>,
    pub(super) iterators: Arc<IteratorManager>,
    pub(super) updater: Option<Arc<Updater>>,
    pub(super) max_results: usize,
}

impl McpServer {
    /// Create a server over loaded databases and an iterator registry
    pub fn new(manager: Arc<DatabaseManager>, iterators: Arc<IteratorManager>) -> Self {
        Self {
            manager,
            iterators,
            updater: None,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    /// Enable the `update_databases` tool
    pub fn with_updater(mut self, updater: Arc<Updater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Page size used when a call omits `max_results`
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// Serve until `reader` reaches EOF
    ///
    /// Lines are read on the calling thread and dispatched to the rayon
    /// pool; the call returns once all in-flight requests have been answered.
    pub fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), McpError>
    where
        R: BufRead,
        W: Write + Send,
    {
        let output = Mutex::new(writer);
        rayon::in_place_scope(|scope| -> Result<(), McpError> {
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let output = &output;
                scope.spawn(move |_| {
                    let Some(response) = self.handle_message(line.trim()) else {
                        return;
                    };
                    if let Err(e) = write_response(output, &response) {
                        error!(error = %e, "failed to write response");
                    }
                });
            }
            debug!("input closed");
            Ok(())
        })
    }

    /// Handle one JSON-RPC message
    ///
    /// Returns `None` for notifications.
    pub fn handle_message(&self, msg: &str) -> Option<JsonRpcResponse> {
        let raw: Value = match serde_json::from_str(msg) {
            Ok(v) => v,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    None,
                    PARSE_ERROR,
                    format!("parse error: {e}"),
                ))
            }
        };

        let id = raw.get("id").cloned().filter(|v| !v.is_null());
        let req: JsonRpcRequest = match serde_json::from_value(raw) {
            Ok(r) => r,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    id,
                    INVALID_REQUEST,
                    format!("invalid request: {e}"),
                ))
            }
        };
        if req.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                "invalid request: jsonrpc must be \"2.0\"",
            ));
        }

        if req.is_notification() {
            debug!(method = %req.method, "notification");
            return None;
        }

        let response = match req.method.as_str() {
            "initialize" => self.handle_initialize(id, &req.params),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(
                id,
                json!({ "tools": tools::list_tools(self.updater.is_some()) }),
            ),
            "tools/call" => self.handle_tools_call(id, &req.params),
            other => {
                JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("method not found: {other}"))
            }
        };
        Some(response)
    }

    fn handle_initialize(&self, id: Option<Value>, params: &Value) -> JsonRpcResponse {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let result = InitializeResult {
            protocol_version: negotiate_protocol_version(requested).into(),
            capabilities: ServerCapabilities {
                tools: ToolCapability {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "mmdb-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };
        JsonRpcResponse::success(id, serde_json::to_value(&result).unwrap_or_default())
    }

    fn handle_tools_call(&self, id: Option<Value>, params: &Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, "missing tool name");
        };
        let args = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(args @ Value::Object(_)) => args.clone(),
            Some(_) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, "arguments must be an object")
            }
        };

        let result = match tools::call_tool(self, name, &args) {
            Ok(payload) => McpToolResult::structured(payload),
            Err(e) => {
                warn!(tool = name, code = e.code(), error = %e, "tool call failed");
                McpToolResult::error(e.code(), &e.to_string())
            }
        };
        JsonRpcResponse::success(id, serde_json::to_value(&result).unwrap_or_default())
    }
}

fn write_response<W: Write>(output: &Mutex<W>, response: &JsonRpcResponse) -> Result<(), McpError> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn empty_server() -> McpServer {
        McpServer::new(
            Arc::new(DatabaseManager::new()),
            Arc::new(IteratorManager::new(Duration::from_secs(60))),
        )
    }

    #[test]
    fn handle_initialize() {
        let server = empty_server();
        let resp = server
            .handle_message(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{}}}"#,
            )
            .unwrap();
        let r = resp.result.unwrap();
        assert_eq!(r["protocolVersion"], "2024-11-05");
        assert_eq!(r["serverInfo"]["name"], "mmdb-mcp");
        assert_eq!(r["capabilities"]["tools"]["listChanged"], false);
    }

    #[test]
    fn notifications_get_no_response() {
        let server = empty_server();
        assert!(server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .is_none());
    }

    #[test]
    fn protocol_errors() {
        let server = empty_server();
        let code = |msg: &str| server.handle_message(msg).unwrap().error.unwrap().code;

        assert_eq!(code("{not json"), PARSE_ERROR);
        assert_eq!(code(r#"{"jsonrpc":"2.0","id":1}"#), INVALID_REQUEST);
        assert_eq!(code(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#), INVALID_REQUEST);
        assert_eq!(code(r#"{"jsonrpc":"2.0","id":1,"method":"bogus"}"#), METHOD_NOT_FOUND);
        assert_eq!(
            code(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}}"#),
            INVALID_PARAMS
        );
    }

    #[test]
    fn ping_echoes_id() {
        let server = empty_server();
        let resp = server
            .handle_message(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#)
            .unwrap();
        assert_eq!(resp.id, json!("abc"));
        assert_eq!(resp.result, Some(json!({})));
    }

    #[test]
    fn tool_errors_are_results() {
        let server = empty_server();
        let resp = server
            .handle_message(
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"lookup_network","arguments":{"network":"10.0.0.0/8"}}}"#,
            )
            .unwrap();
        assert!(resp.error.is_none());
        let r = resp.result.unwrap();
        assert_eq!(r["isError"], true);
        assert_eq!(r["structuredContent"]["error"]["code"], "no_databases");

        let resp = server
            .handle_message(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"update_databases"}}"#,
            )
            .unwrap();
        assert_eq!(
            resp.result.unwrap()["structuredContent"]["error"]["code"],
            "updates_not_available"
        );

        let resp = server
            .handle_message(
                r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"drop_tables"}}"#,
            )
            .unwrap();
        assert_eq!(
            resp.result.unwrap()["structuredContent"]["error"]["code"],
            "unknown_tool"
        );
    }

    #[test]
    fn serve_answers_every_request() {
        let server = empty_server();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        );
        let mut output = Vec::new();
        server.serve(input.as_bytes(), &mut output).unwrap();

        let mut ids: Vec<i64> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_i64().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
