//! Tool calls through the JSON-RPC front-end

use mmdb_mcp::mmdb::{IpVersion, RecordSize};
use mmdb_mcp::{DataValue, DatabaseManager, IteratorManager, McpServer, MmdbWriter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn record(pairs: &[(&str, &str)]) -> DataValue {
    let mut map = HashMap::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), DataValue::String(v.to_string()));
    }
    DataValue::Map(map)
}

fn country(iso: &str) -> DataValue {
    let mut map = HashMap::new();
    map.insert("country".to_string(), record(&[("iso_code", iso)]));
    DataValue::Map(map)
}

fn write_country_db(path: &Path) {
    let mut writer = MmdbWriter::new(IpVersion::V6, RecordSize::Bits24)
        .with_database_type("GeoLite2-Country");
    writer.insert_str("1.0.0.0/26", country("US")).unwrap();
    writer.insert_str("1.0.0.64/26", country("US")).unwrap();
    writer.insert_str("1.0.0.128/26", country("CA")).unwrap();
    writer.insert_str("1.0.0.192/26", country("US")).unwrap();
    std::fs::write(path, writer.build().unwrap()).unwrap();
}

fn write_asn_db(path: &Path) {
    let mut writer =
        MmdbWriter::new(IpVersion::V6, RecordSize::Bits24).with_database_type("GeoLite2-ASN");
    writer
        .insert_str("1.0.0.0/24", record(&[("autonomous_system_organization", "Example Net")]))
        .unwrap();
    std::fs::write(path, writer.build().unwrap()).unwrap();
}

struct Fixture {
    _dir: TempDir,
    server: McpServer,
    iterators: Arc<IteratorManager>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_country_db(&dir.path().join("GeoLite2-Country.mmdb"));
    write_asn_db(&dir.path().join("GeoLite2-ASN.mmdb"));

    let manager = Arc::new(DatabaseManager::new());
    assert_eq!(manager.load_directory(dir.path()).unwrap(), 2);
    let iterators = Arc::new(IteratorManager::new(Duration::from_secs(60)));
    let server = McpServer::new(manager, Arc::clone(&iterators)).with_max_results(1000);
    Fixture {
        _dir: dir,
        server,
        iterators,
    }
}

/// Call a tool, returning (isError, structured payload)
fn call(server: &McpServer, name: &str, args: Value) -> (bool, Value) {
    let msg = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "tools/call",
        "params": { "name": name, "arguments": args }
    });
    let resp = server.handle_message(&msg.to_string()).unwrap();
    assert!(resp.error.is_none(), "unexpected protocol error: {:?}", resp.error);
    assert_eq!(resp.id, json!(7));
    let result = resp.result.unwrap();
    let text: Value =
        serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(text, result["structuredContent"]);
    (
        result.get("isError").and_then(Value::as_bool).unwrap_or(false),
        result["structuredContent"].clone(),
    )
}

fn error_code(payload: &Value) -> &str {
    payload["error"]["code"].as_str().unwrap()
}

#[test]
fn test_tools_list() {
    let f = fixture();
    let resp = f
        .server
        .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
        .unwrap();
    let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["lookup_ip", "lookup_network", "list_databases"]);
    assert_eq!(tools[1]["inputSchema"]["required"], json!(["network"]));
}

#[test]
fn test_list_databases() {
    let f = fixture();
    let (is_error, payload) = call(&f.server, "list_databases", json!({}));
    assert!(!is_error);
    assert_eq!(payload["count"], 2);
    assert_eq!(payload["databases"][0]["name"], "GeoLite2-ASN.mmdb");
    assert_eq!(payload["databases"][0]["type"], "ASN");
    assert_eq!(payload["databases"][1]["name"], "GeoLite2-Country.mmdb");
    assert_eq!(payload["databases"][1]["type"], "Country");
    assert!(payload["databases"][1]["size"].as_u64().unwrap() > 0);
    assert!(payload["databases"][1].get("path").is_none());
}

#[test]
fn test_lookup_ip_single_database() {
    let f = fixture();
    let (is_error, payload) = call(
        &f.server,
        "lookup_ip",
        json!({"ip": "1.0.0.130", "database": "GeoLite2-Country.mmdb"}),
    );
    assert!(!is_error);
    assert_eq!(payload["network"], "1.0.0.128/26");
    assert_eq!(payload["data"]["country"]["iso_code"], "CA");

    let (_, missing) = call(
        &f.server,
        "lookup_ip",
        json!({"ip": "9.9.9.9", "database": "GeoLite2-Country.mmdb"}),
    );
    assert_eq!(missing["data"], Value::Null);
    assert_eq!(missing["network"], Value::Null);
}

#[test]
fn test_lookup_ip_all_databases() {
    let f = fixture();
    let (is_error, payload) = call(&f.server, "lookup_ip", json!({"ip": "1.0.0.1"}));
    assert!(!is_error);
    assert_eq!(payload["ip"], "1.0.0.1");
    let results = payload["results"].as_object().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(
        results["GeoLite2-ASN.mmdb"]["data"]["autonomous_system_organization"],
        "Example Net"
    );
    assert_eq!(results["GeoLite2-Country.mmdb"]["network"], "1.0.0.0/26");
}

#[test]
fn test_lookup_ip_errors() {
    let f = fixture();
    let (is_error, payload) = call(&f.server, "lookup_ip", json!({}));
    assert!(is_error);
    assert_eq!(error_code(&payload), "missing_parameter");

    let (_, payload) = call(&f.server, "lookup_ip", json!({"ip": "1.2.3"}));
    assert_eq!(error_code(&payload), "invalid_ip");

    let (_, payload) = call(
        &f.server,
        "lookup_ip",
        json!({"ip": "1.2.3.4", "database": "nope.mmdb"}),
    );
    assert_eq!(error_code(&payload), "db_not_found");
}

#[test]
fn test_lookup_network_pages_and_resumes() {
    let f = fixture();
    let args = json!({
        "network": "1.0.0.0/24",
        "database": "GeoLite2-Country.mmdb",
        "filters": [{"field": "country.iso_code", "operator": "eq", "value": "US"}],
        "max_results": 2
    });
    let (is_error, first) = call(&f.server, "lookup_network", args);
    assert!(!is_error, "{}", first);
    assert_eq!(first["results"].as_array().unwrap().len(), 2);
    assert_eq!(first["has_more"], true);
    assert_eq!(first["total_matched"], 2);
    assert_eq!(first["database"], "GeoLite2-Country.mmdb");
    assert_eq!(first["network"], "1.0.0.0/24");

    // Live iterator by ID
    let (_, second) = call(
        &f.server,
        "lookup_network",
        json!({"network": "1.0.0.0/24", "iterator_id": first["iterator_id"], "max_results": 10}),
    );
    assert_eq!(second["iterator_id"], first["iterator_id"]);
    assert_eq!(second["results"][0]["network"], "1.0.0.192/26");
    assert_eq!(second["has_more"], false);
    assert_eq!(second["total_processed"], 4);
    assert_eq!(second["total_matched"], 3);

    // Expired iterator falls back to the token
    f.iterators.remove(first["iterator_id"].as_str().unwrap());
    let (is_error, resumed) = call(
        &f.server,
        "lookup_network",
        json!({
            "network": "1.0.0.0/24",
            "iterator_id": first["iterator_id"],
            "resume_token": first["resume_token"],
        }),
    );
    assert!(!is_error, "{}", resumed);
    assert_ne!(resumed["iterator_id"], first["iterator_id"]);
    assert_eq!(resumed["results"][0]["network"], "1.0.0.192/26");
    assert_eq!(resumed["total_matched"], 3);
    assert_eq!(resumed["database"], "GeoLite2-Country.mmdb");
}

#[test]
fn test_live_iterator_reports_its_own_binding() {
    let f = fixture();
    let (_, first) = call(
        &f.server,
        "lookup_network",
        json!({"network": "1.0.0.0/24", "database": "GeoLite2-Country.mmdb", "max_results": 1}),
    );
    let (is_error, next) = call(
        &f.server,
        "lookup_network",
        json!({
            "network": "10.0.0.0/8",
            "database": "GeoLite2-ASN.mmdb",
            "iterator_id": first["iterator_id"],
            "max_results": 1
        }),
    );
    assert!(!is_error, "{}", next);
    assert_eq!(next["iterator_id"], first["iterator_id"]);
    assert_eq!(next["network"], "1.0.0.0/24");
    assert_eq!(next["database"], "GeoLite2-Country.mmdb");
    assert_eq!(next["results"][0]["network"], "1.0.0.64/26");
}

#[test]
fn test_lookup_network_defaults_to_first_database() {
    let f = fixture();
    let (is_error, payload) = call(&f.server, "lookup_network", json!({"network": "1.0.0.0/24"}));
    assert!(!is_error);
    assert_eq!(payload["database"], "GeoLite2-ASN.mmdb");
    assert_eq!(payload["results"][0]["network"], "1.0.0.0/24");
}

#[test]
fn test_lookup_network_errors() {
    let f = fixture();
    let cases = [
        (json!({}), "missing_parameter"),
        (json!({"network": "1.0.0.0/33"}), "invalid_network"),
        (
            json!({"network": "1.0.0.0/24", "database": "missing.mmdb"}),
            "db_not_found",
        ),
        (
            json!({"network": "1.0.0.0/24", "filters": ["country.iso_code=US"]}),
            "invalid_filter",
        ),
        (
            json!({"network": "1.0.0.0/24", "filters": [{"field": "x", "operator": "like", "value": 1}]}),
            "invalid_filter",
        ),
        (
            json!({"network": "1.0.0.0/24", "filters": [{"field": "x", "operator": "regex", "value": "("}]}),
            "invalid_filter",
        ),
        (
            json!({"network": "1.0.0.0/24", "resume_token": "not a token"}),
            "resume_failed",
        ),
        (
            json!({"network": "1.0.0.0/24", "max_results": 0}),
            "invalid_parameter",
        ),
    ];
    for (args, expected) in cases {
        let (is_error, payload) = call(&f.server, "lookup_network", args.clone());
        assert!(is_error, "{} should fail", args);
        assert_eq!(error_code(&payload), expected, "{}", args);
    }
}

#[test]
fn test_string_filter_gets_a_hint() {
    let f = fixture();
    let (_, payload) = call(
        &f.server,
        "lookup_network",
        json!({"network": "1.0.0.0/24", "filters": ["country.iso_code=US"]}),
    );
    let message = payload["error"]["message"].as_str().unwrap();
    assert!(message.contains(r#""operator": "equals""#), "{}", message);
}

#[test]
fn test_update_without_updater() {
    let f = fixture();
    let (is_error, payload) = call(&f.server, "update_databases", json!({}));
    assert!(is_error);
    assert_eq!(error_code(&payload), "updates_not_available");
}
