use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use mmdb_mcp::filter::{FilterMode, Operator, Predicate};
use mmdb_mcp::iterator::NetworkSource;
use mmdb_mcp::{Database, IteratorManager};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Parse `FIELD:OPERATOR:VALUE`
///
/// VALUE is read as JSON when it parses, otherwise as a plain string.
/// `exists` may omit the value and means `true`.
fn parse_filter(spec: &str) -> Result<Predicate> {
    let mut parts = spec.splitn(3, ':');
    let field = parts.next().unwrap_or_default().trim();
    let Some(operator) = parts.next() else {
        bail!("Invalid filter '{}': expected FIELD:OPERATOR:VALUE", spec);
    };
    let operator: Operator = operator
        .trim()
        .parse()
        .with_context(|| format!("Invalid filter '{}'", spec))?;

    let value = match parts.next() {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        None if operator == Operator::Exists => Value::Bool(true),
        None => bail!("Invalid filter '{}': missing value", spec),
    };
    Ok(Predicate::new(field, operator, value))
}

pub fn cmd_scan(
    database: PathBuf,
    network: String,
    filters: Vec<String>,
    mode: String,
    max_results: usize,
    resume: Option<String>,
) -> Result<()> {
    let db = Database::open(&database)
        .with_context(|| format!("Failed to load database: {}", database.display()))?;
    let source: Arc<dyn NetworkSource> = Arc::new(db);
    let name = database
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| database.display().to_string());

    let iterators = IteratorManager::new(Duration::from_secs(60));
    let iterator = match resume {
        Some(token) => iterators
            .resume(source, &token)
            .context("Failed to resume scan")?,
        None => {
            let network: IpNet = network
                .trim()
                .parse()
                .with_context(|| format!("Invalid network: {}", network))?;
            let predicates = filters
                .iter()
                .map(|f| parse_filter(f))
                .collect::<Result<Vec<_>>>()?;
            iterators
                .create(source, &name, network, predicates, FilterMode::parse(&mode))
                .context("Failed to start scan")?
        }
    };

    let batch = iterators
        .advance(&iterator, max_results)
        .context("Scan failed")?;
    println!("{}", serde_json::to_string_pretty(&batch)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_filter() {
        let p = parse_filter("country.iso_code:equals:US").unwrap();
        assert_eq!(p.field, "country.iso_code");
        assert_eq!(p.operator, Operator::Equals);
        assert_eq!(p.value, json!("US"));

        let p = parse_filter("location.accuracy_radius:gte:100").unwrap();
        assert_eq!(p.operator, Operator::GreaterThanOrEqual);
        assert_eq!(p.value, json!(100));

        let p = parse_filter(r#"country.iso_code:in:["US","CA"]"#).unwrap();
        assert_eq!(p.value, json!(["US", "CA"]));

        let p = parse_filter("traits.is_anycast:exists").unwrap();
        assert_eq!(p.value, json!(true));

        // Colons after the operator belong to the value
        let p = parse_filter("network:equals:2001:db8::").unwrap();
        assert_eq!(p.value, json!("2001:db8::"));

        assert!(parse_filter("country").is_err());
        assert!(parse_filter("country:like:US").is_err());
        assert!(parse_filter("country:equals").is_err());
    }
}
