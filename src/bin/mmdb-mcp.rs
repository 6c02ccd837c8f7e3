mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::{cmd_build, cmd_config, cmd_lookup, cmd_scan, cmd_serve};

#[derive(Parser)]
#[command(name = "mmdb-mcp")]
#[command(
    about = "MCP server for MaxMind DB lookups and filtered network scans",
    long_about = "mmdb-mcp - Serve MaxMind DB (.mmdb) files to MCP clients over stdio\n\n\
    Without a subcommand the server starts, speaking JSON-RPC on stdin/stdout.\n\
    Logs go to stderr.\n\n\
    Examples:\n\
      mmdb-mcp --config ~/.config/mmdb-mcp/config.toml\n\
      mmdb-mcp lookup GeoLite2-City.mmdb 8.8.8.8\n\
      mmdb-mcp scan GeoLite2-Country.mmdb 1.0.0.0/16 --filter country.iso_code:equals:US\n\
      mmdb-mcp build networks.json -o custom.mmdb -t My-Networks\n\
      mmdb-mcp config > mmdb-mcp.toml"
)]
#[command(version)]
struct Cli {
    /// Configuration file (default: search MMDB_MCP_CONFIG and standard locations)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server on stdin/stdout (default)
    Serve,

    /// Look up one IP address in a database file
    Lookup {
        /// Path to the .mmdb file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// IPv4 or IPv6 address
        #[arg(value_name = "IP")]
        ip: String,
    },

    /// Scan the networks inside a CIDR block and print one batch
    Scan {
        /// Path to the .mmdb file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// CIDR block to scan
        #[arg(value_name = "CIDR")]
        network: String,

        /// Filter as FIELD:OPERATOR:VALUE; VALUE is parsed as JSON when possible
        /// Example: --filter country.iso_code:in:'["US","CA"]'
        #[arg(short, long = "filter", value_name = "FILTER")]
        filters: Vec<String>,

        /// How filters combine: and, or
        #[arg(short, long, default_value = "and")]
        mode: String,

        /// Maximum results in the batch
        #[arg(short = 'n', long, default_value = "1000")]
        max_results: usize,

        /// Continue from a resume token printed by an earlier scan
        #[arg(long, value_name = "TOKEN")]
        resume: Option<String>,
    },

    /// Build a database from a JSON object of {"cidr": {record}}
    Build {
        /// Input JSON file
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output database file (.mmdb)
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Database type stored in the metadata
        #[arg(short = 't', long, value_name = "NAME")]
        database_type: Option<String>,

        /// English description stored in the metadata
        #[arg(short = 'd', long)]
        description: Option<String>,

        /// Record size in bits: 24, 28 or 32
        #[arg(long, default_value = "28")]
        record_size: u16,

        /// Build an IPv4-only tree instead of IPv6
        #[arg(long)]
        ipv4: bool,
    },

    /// Print the default configuration file
    Config,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(cli.config),
        Commands::Lookup { database, ip } => cmd_lookup(database, ip),
        Commands::Scan {
            database,
            network,
            filters,
            mode,
            max_results,
            resume,
        } => cmd_scan(database, network, filters, mode, max_results, resume),
        Commands::Build {
            input,
            output,
            database_type,
            description,
            record_size,
            ipv4,
        } => cmd_build(input, output, database_type, description, record_size, ipv4),
        Commands::Config => cmd_config(),
    }
}
