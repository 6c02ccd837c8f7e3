use anyhow::Result;
use mmdb_mcp::Config;

pub fn cmd_config() -> Result<()> {
    print!("{}", Config::default_toml());
    Ok(())
}
