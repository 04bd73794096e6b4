use accp_config::load_config;
use accp_server::AccpServer;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "accp", version, about = "Access control caching proxy")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "ACCP_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    // Optional .env for local development
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let cli = Cli::parse();

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    accp_server::init_tracing(&cfg.logger.level, cfg.logger.format);
    accp_server::metrics::init_metrics();
    tracing::info!(
        path = cli.config.as_deref().unwrap_or(accp_config::loader::DEFAULT_CONFIG_FILE),
        routes = cfg.proxy.routes.len(),
        "configuration loaded"
    );

    let server = match AccpServer::bootstrap(&cfg).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "initialization failed");
            eprintln!("Initialization failed: {e:#}");
            std::process::exit(2);
        }
    };

    let bound = match server.bind().await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "bind failed");
            eprintln!("Bind failed: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(err) = bound.serve().await {
        tracing::error!(error = %format!("{err:#}"), "server error");
        eprintln!("Server error: {err:#}");
        std::process::exit(1);
    }
}
