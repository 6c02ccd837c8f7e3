//! Tool definitions and dispatch
//!
//! Each tool returns a JSON payload on success. Failures are [`McpError::Tool`]
//! values whose code ends up in the `{"error": {...}}` tool result.

use super::error::McpError;
use super::protocol::McpTool;
use super::server::McpServer;
use crate::database::Database;
use crate::filter::{self, FilterMode};
use crate::iterator::{IteratorError, ManagedIterator, NetworkSource, ResumeToken};
use ipnet::IpNet;
use serde_json::{json, Map, Value};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Tools offered by a server; `update_databases` only with an updater
pub fn list_tools(with_updates: bool) -> Vec<McpTool> {
    let operators: Vec<&str> = filter::Operator::ALL.iter().map(|op| op.as_str()).collect();
    let mut tools = vec![
        McpTool {
            name: "lookup_ip".into(),
            description: "Look up the record for an IP address in one database or in all of them."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "ip": { "type": "string", "description": "IPv4 or IPv6 address" },
                    "database": { "type": "string", "description": "Database name (optional, default: all)" }
                },
                "required": ["ip"]
            }),
        },
        McpTool {
            name: "lookup_network".into(),
            description: "Scan the networks inside a CIDR block, optionally filtered. Results are \
                          paged: pass iterator_id to continue, or resume_token if the iterator expired."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "network": { "type": "string", "description": "CIDR to scan, e.g. '192.168.1.0/24'" },
                    "database": { "type": "string", "description": "Database name (optional, default: first database)" },
                    "filters": {
                        "type": "array",
                        "description": "Filter objects: {field, operator, value}",
                        "items": {
                            "type": "object",
                            "properties": {
                                "field": { "type": "string", "description": "Dot path such as 'country.iso_code'" },
                                "operator": {
                                    "type": "string",
                                    "enum": operators
                                },
                                "value": {}
                            },
                            "required": ["field", "operator"]
                        }
                    },
                    "filter_mode": { "type": "string", "enum": ["and", "or"], "description": "How filters combine (default: and)" },
                    "max_results": { "type": "number", "description": "Maximum results per page (default: 1000)" },
                    "iterator_id": { "type": "string", "description": "Continue a live iterator" },
                    "resume_token": { "type": "string", "description": "Continue from a token if the iterator expired" }
                },
                "required": ["network"]
            }),
        },
        McpTool {
            name: "list_databases".into(),
            description: "List the loaded MaxMind databases.".into(),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
    ];

    if with_updates {
        tools.push(McpTool {
            name: "update_databases".into(),
            description: "Refresh the configured database editions now.".into(),
            input_schema: json!({ "type": "object", "properties": {} }),
        });
    }
    tools
}

/// Run a tool by name
pub fn call_tool(server: &McpServer, name: &str, args: &Value) -> Result<Value, McpError> {
    match name {
        "lookup_ip" => lookup_ip(server, args),
        "lookup_network" => lookup_network(server, args),
        "list_databases" => Ok(list_databases(server)),
        "update_databases" => update_databases(server),
        other => Err(McpError::tool("unknown_tool", format!("Unknown tool: {}", other))),
    }
}

/// String argument; empty strings count as absent
fn str_arg<'a>(args: &'a Value, name: &str) -> Result<Option<&'a str>, McpError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(McpError::tool(
            "invalid_parameter",
            format!("Parameter {} must be a string", name),
        )),
    }
}

fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, McpError> {
    str_arg(args, name)?.ok_or_else(|| {
        McpError::tool(
            "missing_parameter",
            format!("Missing required parameter: {}", name),
        )
    })
}

/// Positive integer; fractional input is truncated
fn max_results_arg(args: &Value, default: usize) -> Result<usize, McpError> {
    let invalid = || McpError::tool("invalid_parameter", "max_results must be a positive number");
    match args.get("max_results") {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => {
            let value = n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 1.0).map(|f| f as u64))
                .ok_or_else(invalid)?;
            if value == 0 {
                return Err(invalid());
            }
            Ok(usize::try_from(value).unwrap_or(usize::MAX))
        }
        Some(_) => Err(invalid()),
    }
}

fn database(server: &McpServer, name: &str) -> Result<Arc<Database>, McpError> {
    server
        .manager
        .get(name)
        .ok_or_else(|| McpError::tool("db_not_found", format!("Database not found: {}", name)))
}

fn lookup_ip(server: &McpServer, args: &Value) -> Result<Value, McpError> {
    let ip_str = required_str(args, "ip")?;
    let ip: IpAddr = ip_str
        .trim()
        .parse()
        .map_err(|_| McpError::tool("invalid_ip", format!("Invalid IP address: {}", ip_str)))?;

    if let Some(name) = str_arg(args, "database")? {
        let db = database(server, name)?;
        let found = db
            .lookup_ip(ip)
            .map_err(|e| McpError::tool(e.code(), format!("Lookup failed: {}", e)))?;
        let (network, data) = match found {
            Some(hit) => (json!(hit.network.to_string()), serde_json::to_value(&hit.data)?),
            None => (Value::Null, Value::Null),
        };
        return Ok(json!({
            "ip": ip_str,
            "database": name,
            "network": network,
            "data": data,
        }));
    }

    let mut results = Map::new();
    for (name, db) in server.manager.all() {
        match db.lookup_ip(ip) {
            Ok(Some(hit)) => {
                results.insert(
                    name,
                    json!({
                        "network": hit.network.to_string(),
                        "data": serde_json::to_value(&hit.data)?,
                    }),
                );
            }
            Ok(None) => {
                results.insert(name, json!({ "network": null, "data": null }));
            }
            Err(e) => debug!(database = %name, error = %e, "skipping database in lookup"),
        }
    }
    Ok(json!({ "ip": ip_str, "results": results }))
}

fn lookup_network(server: &McpServer, args: &Value) -> Result<Value, McpError> {
    let network_str = required_str(args, "network")?;
    let network: IpNet = network_str.trim().parse().map_err(|_| {
        McpError::tool("invalid_network", format!("Invalid network: {}", network_str))
    })?;

    let predicates = filter::parse_predicates(args.get("filters").unwrap_or(&Value::Null))
        .map_err(|e| McpError::tool(e.code(), format!("Invalid filters: {}", e)))?;
    filter::validate(&predicates)
        .map_err(|e| McpError::tool(e.code(), format!("Invalid filters: {}", e)))?;
    let mode = str_arg(args, "filter_mode")?
        .map(FilterMode::parse)
        .unwrap_or_default();
    let max_results = max_results_arg(args, server.max_results)?;

    let requested_db = str_arg(args, "database")?;
    let live = str_arg(args, "iterator_id")?.and_then(|id| {
        let found = server.iterators.lookup(id);
        match &found {
            None => debug!(iterator = %id, "iterator not live, falling back"),
            Some(it) => {
                // A live iterator keeps its own binding; the reply reports it
                if it.network() != network.trunc()
                    || requested_db.is_some_and(|db| db != it.database())
                {
                    debug!(
                        iterator = %id,
                        bound_network = %it.network(),
                        bound_database = it.database(),
                        requested_network = %network,
                        "call arguments differ from the live iterator's binding"
                    );
                }
            }
        }
        found
    });

    let iterator: Arc<ManagedIterator> = match live {
        Some(iterator) => iterator,
        None => match str_arg(args, "resume_token")? {
            Some(token) => resume(server, token)?,
            None => {
                let name = match requested_db {
                    Some(name) => name.to_string(),
                    None => server
                        .manager
                        .list()
                        .into_iter()
                        .next()
                        .map(|info| info.name)
                        .ok_or_else(|| {
                            McpError::tool("no_databases", "No databases available")
                        })?,
                };
                let source: Arc<dyn NetworkSource> = database(server, &name)?;
                server
                    .iterators
                    .create(source, &name, network, predicates, mode)
                    .map_err(|e| match e {
                        IteratorError::Filter(e) => {
                            McpError::tool(e.code(), format!("Invalid filters: {}", e))
                        }
                        other => McpError::tool(
                            "iterator_creation_failed",
                            format!("Failed to create iterator: {}", other),
                        ),
                    })?
            }
        },
    };

    let batch = server
        .iterators
        .advance(&iterator, max_results)
        .map_err(|e| McpError::tool("iteration_failed", format!("Iteration failed: {}", e)))?;

    let mut payload = serde_json::to_value(&batch)?;
    if let Value::Object(map) = &mut payload {
        map.insert("database".into(), json!(iterator.database()));
        map.insert("network".into(), json!(iterator.network().to_string()));
    }
    Ok(payload)
}

fn resume(server: &McpServer, token: &str) -> Result<Arc<ManagedIterator>, McpError> {
    let token = ResumeToken::decode(token).map_err(resume_failed)?;
    let source: Arc<dyn NetworkSource> = server
        .manager
        .get(&token.database)
        .ok_or_else(|| resume_failed(format!("database '{}' is not loaded", token.database)))?;
    server
        .iterators
        .resume_from(source, &token)
        .map_err(resume_failed)
}

fn resume_failed(e: impl std::fmt::Display) -> McpError {
    McpError::tool("resume_failed", format!("Failed to resume iterator: {}", e))
}

fn list_databases(server: &McpServer) -> Value {
    let databases = server.manager.list();
    let count = databases.len();
    json!({ "databases": databases, "count": count })
}

fn update_databases(server: &McpServer) -> Result<Value, McpError> {
    let updater = server.updater.as_ref().ok_or_else(|| {
        McpError::tool(
            "updates_not_available",
            "Database updates not available in this mode",
        )
    })?;
    let results = updater.update_all();
    Ok(json!({ "results": results }))
}
