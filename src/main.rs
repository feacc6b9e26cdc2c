//! Flow Guard - Entry Point

use flow_guard::{Config, FlowServer};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Flow Guard v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: flow-guard");
        println!();
        println!("Environment variables:");
        println!("  PORT                     API port (default: 3001)");
        println!("  BIND_ADDR                Bind address (default: 127.0.0.1)");
        println!("  FLOW_ENV / NODE_ENV      development | production");
        println!("  FRONTEND_PORT            Trusted frontend port (default: 2727)");
        println!("  FLOW_DATA_DIR            Vault and credential directory");
        println!("  ORIGINS_FILE             Trusted origin list (JSON)");
        println!("  AUTOMATION_URL           Credential retrieval sidecar");
        println!("  VAULT_PASSPHRASE         Derive the vault key from a passphrase");
        println!("  SKIP_RATE_LIMIT          Development only");
        println!("  ALLOW_ANY_ORIGIN_IN_DEV  Development only");
        println!("  TRUST_PROXY              Key rate limits on X-Forwarded-For");
        println!("  LOG_REQUESTS             Request tracing (default: true)");
        println!("  LOG_FORMAT               text | json");
        println!("  RUST_LOG                 Log filter (default: info)");
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Flow Guard v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let server = FlowServer::from_config(config).await?;
    server.run().await?;

    Ok(())
}
