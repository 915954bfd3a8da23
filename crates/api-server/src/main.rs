//! Signal gate binary entrypoint.

use anyhow::Context;
use api_server::ApiServer;
use auth::{hash_phrase, JwtAuth, JwtConfig, OperatorRole, SecondFactor};
use clap::{Parser, Subcommand};
use signal_core::config::{Config, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_LOG_FILTER: &str =
    "api_server=debug,trading_engine=debug,risk_manager=info,auth=info,signal_core=info,tower_http=debug";

#[derive(Parser)]
#[command(name = "signal-gate")]
#[command(version)]
#[command(about = "Fail-safe signal-to-execution control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Configuration file (TOML)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Hash a secret phrase for mode.secret_phrase_hash
    HashPhrase {
        /// Phrase to hash
        phrase: String,
    },
    /// Generate a base32 TOTP secret for mode.totp_secret
    TotpSecret,
    /// Mint an operator JWT
    IssueToken {
        /// Operator identity recorded in the audit log
        #[arg(long)]
        actor: String,
        /// viewer, operator or admin
        #[arg(long, default_value = "operator")]
        role: OperatorRole,
        /// Configuration file (TOML)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve {
        config: PathBuf::from(DEFAULT_CONFIG_PATH),
    }) {
        Commands::Serve { config } => serve(config).await,
        Commands::HashPhrase { phrase } => {
            println!("{}", hash_phrase(&phrase)?);
            Ok(())
        }
        Commands::TotpSecret => {
            let secret = auth::totp::generate_secret();
            println!("{}", secret);
            if let Some(uri) = SecondFactor::new(&secret)?.provisioning_uri() {
                println!("{}", uri);
            }
            Ok(())
        }
        Commands::IssueToken {
            actor,
            role,
            config,
        } => {
            let config = Config::load_from(&config)?;
            let jwt = JwtAuth::new(JwtConfig::from_admin(&config.admin));
            println!("{}", jwt.create_token(&actor, role)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn serve(config_path: PathBuf) -> anyhow::Result<()> {
    init_tracing();

    let config = Config::load_from(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let pool = match &config.database.url {
        Some(_) => {
            let pool = signal_core::db::create_pool(&config.database).await?;

            // SKIP_MIGRATIONS=true leaves schema management to the operator
            let skip_migrations = std::env::var("SKIP_MIGRATIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);

            if !skip_migrations {
                tracing::info!("Running database migrations...");
                sqlx::migrate!("../../migrations").run(&pool).await?;
            } else {
                tracing::info!("Skipping migrations (SKIP_MIGRATIONS=true)");
            }
            Some(pool)
        }
        None => None,
    };

    let server = ApiServer::new(config, pool).await?;
    server.run().await?;

    Ok(())
}
