use anyhow::{Context, Result};
use mmdb_mcp::Database;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::path::PathBuf;

pub fn cmd_lookup(database: PathBuf, ip: String) -> Result<()> {
    let addr: IpAddr = ip
        .trim()
        .parse()
        .with_context(|| format!("Invalid IP address: {}", ip))?;

    let db = Database::open(&database)
        .with_context(|| format!("Failed to load database: {}", database.display()))?;

    let found = db
        .lookup_ip(addr)
        .with_context(|| format!("Lookup failed for: {}", ip))?;

    let output = match found {
        Some(hit) => json!({
            "ip": ip,
            "network": hit.network.to_string(),
            "data": serde_json::to_value(&hit.data)?,
        }),
        None => json!({ "ip": ip, "network": Value::Null, "data": Value::Null }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
