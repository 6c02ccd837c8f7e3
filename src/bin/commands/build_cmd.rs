use anyhow::{bail, Context, Result};
use mmdb_mcp::mmdb::{IpVersion, RecordSize};
use mmdb_mcp::{DataValue, MmdbWriter};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::info;

pub fn cmd_build(
    input: PathBuf,
    output: PathBuf,
    database_type: Option<String>,
    description: Option<String>,
    record_size: u16,
    ipv4: bool,
) -> Result<()> {
    let record_size = RecordSize::from_bits(record_size)
        .with_context(|| format!("Unsupported record size: {}", record_size))?;
    let ip_version = if ipv4 { IpVersion::V4 } else { IpVersion::V6 };

    let content = fs::read_to_string(&input)
        .with_context(|| format!("Failed to read input file: {}", input.display()))?;
    let parsed: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON: {}", input.display()))?;
    let Value::Object(entries) = parsed else {
        bail!("Input must be a JSON object mapping CIDR strings to records");
    };

    let mut writer = MmdbWriter::new(ip_version, record_size);
    if let Some(db_type) = database_type {
        writer = writer.with_database_type(db_type);
    }
    if let Some(desc) = description {
        writer = writer.with_description("en", desc);
    }

    for (key, record) in &entries {
        let data = DataValue::from_json(record)
            .map_err(|e| anyhow::anyhow!("Invalid record for {}: {}", key, e))?;
        writer
            .insert_str(key, data)
            .with_context(|| format!("Failed to add {}", key))?;
    }

    let bytes = writer.build().context("Failed to build database")?;
    fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write output file: {}", output.display()))?;

    info!(
        networks = writer.len(),
        bytes = bytes.len(),
        output = %output.display(),
        "database written"
    );
    Ok(())
}
