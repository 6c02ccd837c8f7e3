//! Model Context Protocol front-end over stdio
//!
//! [`McpServer`] exposes the loaded databases as four tools:
//!
//! - `lookup_ip`: record for one address
//! - `lookup_network`: paged, filtered scan of a CIDR block
//! - `list_databases`: what is loaded
//! - `update_databases`: refresh editions (only with an updater)
//!
//! Tool failures are answered as tool results with `isError` set and a
//! `{"error": {"code", "message"}}` payload, never as JSON-RPC errors.
//!
//! ```no_run
//! use mmdb_mcp::database::DatabaseManager;
//! use mmdb_mcp::iterator::IteratorManager;
//! use mmdb_mcp::mcp::McpServer;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let manager = Arc::new(DatabaseManager::new());
//! manager.load_directory("/var/lib/GeoIP")?;
//! let iterators = Arc::new(IteratorManager::new(Duration::from_secs(600)));
//!
//! let server = McpServer::new(manager, iterators);
//! server.serve(std::io::stdin().lock(), std::io::stdout())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod protocol;
mod server;
mod tools;

pub use error::McpError;
pub use protocol::{
    negotiate_protocol_version, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpContent,
    McpTool, McpToolResult, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    SUPPORTED_PROTOCOL_VERSIONS,
};
pub use server::{McpServer, DEFAULT_MAX_RESULTS};
pub use tools::list_tools;
