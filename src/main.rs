use clap::Parser;
use tracing_subscriber::EnvFilter;

use repolens::config::Config;
use repolens::server;

#[derive(Parser)]
#[command(name = "repolens", version, about = "GitHub repository analysis API")]
struct Cli {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite database path (overrides DATABASE_URL)
    #[arg(long)]
    db_path: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Force development mode (permissive CORS) regardless of ENVIRONMENT
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.db_path {
        config.database_path = path;
    }
    if cli.dev {
        config.environment = "development".to_string();
    }

    server::start_server(config).await
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "repolens=debug,tower_http=debug"
    } else {
        "repolens=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}
