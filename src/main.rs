//! Emuhost server
//!
//! Provisions one Android emulator container per user and proxies each
//! user's traffic to their own emulator.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use emuhost_api::{ApiServer, ApiServerConfig, AppState};
use emuhost_auth::{AuthGate, JwtTokenService};
use emuhost_control::{
    AccountService, DeviceRegistry, Keyspace, LifecycleCoordinator, PortAllocator,
};
use emuhost_router::ProxyRouter;
use emuhost_runtime::{ContainerRuntime, DockerRuntime, SimulatedRuntime};
use emuhost_store::{KvStore, MemoryStore, RedisStore};

use crate::config::{EmuhostConfig, RuntimeBackend, StoreBackend};

/// How long shutdown waits for in-flight device teardowns
const TEARDOWN_GRACE: Duration = Duration::from_secs(30);

/// Emuhost - per-user Android emulators behind one authenticated endpoint
#[derive(Parser, Debug)]
#[command(name = "emuhost")]
#[command(about = "Provision per-user Android emulators and route traffic to them")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the API server and device proxy
    Serve(ServeArgs),

    /// Mint a bearer token for manual testing
    GenerateToken {
        /// Signing secret (must match the server's auth.secret_key)
        #[arg(long, env = "EMUHOST_SECRET_KEY", hide_env_values = true)]
        secret: String,

        /// Username the token is issued for
        #[arg(long)]
        username: String,

        /// Display name carried in the token
        #[arg(long)]
        name: Option<String>,

        /// Token issuer (must match the server's auth.issuer)
        #[arg(long, default_value = "emuhost")]
        issuer: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the YAML config file (falls back to CONFIG_PATH, then ./emuhost.yml)
    #[arg(long, env = "EMUHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Override server.bind_addr
    #[arg(long)]
    bind_addr: Option<String>,

    /// Override auth.secret_key
    #[arg(long, env = "EMUHOST_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Override store.redis_url
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Log level (trace, debug, info, warn, error), RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::GenerateToken {
            secret,
            username,
            name,
            issuer,
            hours,
        } => generate_token(&secret, &username, name.as_deref(), &issuer, hours),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn load_config(args: &ServeArgs) -> Result<EmuhostConfig> {
    let mut config = match EmuhostConfig::resolve_path(args.config.clone()) {
        Some(path) => {
            info!("Loading config from {:?}", path);
            EmuhostConfig::load(&path)?
        }
        None => {
            info!("No config file found, using defaults");
            EmuhostConfig::default()
        }
    };

    if let Some(bind_addr) = &args.bind_addr {
        config.server.bind_addr = bind_addr.clone();
    }
    if let Some(secret) = &args.secret_key {
        config.auth.secret_key = Some(secret.clone());
    }
    if let Some(redis_url) = &args.redis_url {
        config.store.redis_url = redis_url.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn serve(args: ServeArgs) -> Result<()> {
    init_logging(&args.log_level)?;

    let config = load_config(&args)?;
    info!(
        "Starting {} {} ({})",
        config.service_name,
        env!("GIT_TAG"),
        env!("GIT_HASH")
    );
    if config.development {
        warn!("Development mode: in-memory store and simulated runtime are allowed");
    }

    let store: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Redis => {
            info!("Connecting to Redis at {}", config.store.redis_url);
            Arc::new(
                RedisStore::connect(&config.store.redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            )
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store, state is lost on restart and not shared");
            Arc::new(MemoryStore::new())
        }
    };
    let keys = Keyspace::new(config.store.namespace.clone());

    let secret = config
        .auth
        .secret_key
        .as_deref()
        .context("auth.secret_key is required")?;
    let token_ttl = chrono::Duration::hours(config.auth.token_ttl_hours);
    let tokens = Arc::new(
        JwtTokenService::new(secret.as_bytes(), config.auth.issuer.clone(), token_ttl)
            .context("Failed to initialise token service")?,
    );
    let gate = AuthGate::new(tokens.clone());

    let ports = PortAllocator::new(
        store.clone(),
        keys.clone(),
        config.ports.start,
        config.ports.end,
    )?
    .with_bind_check(config.ports.verify_bindable);
    info!(
        "Device port range: {}-{} ({} ports)",
        config.ports.start,
        config.ports.end,
        config.ports.end - config.ports.start
    );

    let registry = DeviceRegistry::new(store.clone(), keys.clone());

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime.backend {
        RuntimeBackend::Docker => Arc::new(
            DockerRuntime::connect(config.docker_config())
                .await
                .context("Failed to connect to the Docker daemon")?,
        ),
        RuntimeBackend::Simulated => {
            warn!("Using simulated runtime, no emulators will be launched");
            Arc::new(SimulatedRuntime::new())
        }
    };

    let coordinator = LifecycleCoordinator::new(
        ports,
        registry.clone(),
        runtime,
        config.runtime_timeouts(),
    );

    let state = AppState {
        accounts: AccountService::new(store.clone(), keys, tokens, token_ttl),
        coordinator: coordinator.clone(),
        gate: gate.clone(),
        proxy: ProxyRouter::new(gate, registry, config.proxy_config()),
        store,
    };

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: config.bind_addr()?,
            enable_cors: config.server.enable_cors,
        },
        state,
    );

    server.start(shutdown_signal()).await?;

    info!("Waiting for in-flight device teardowns");
    let aborted = coordinator.shutdown(TEARDOWN_GRACE).await;
    if aborted > 0 {
        warn!(
            "{} teardown task(s) did not finish in time; affected devices keep their last status",
            aborted
        );
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }
}

fn generate_token(
    secret: &str,
    username: &str,
    name: Option<&str>,
    issuer: &str,
    hours: i64,
) -> Result<()> {
    let service = JwtTokenService::new(secret.as_bytes(), issuer, chrono::Duration::hours(hours))
        .context("Failed to initialise token service")?;
    let (token, identity) = service
        .mint(username, name.unwrap_or(username))
        .context("Failed to generate token")?;

    println!("\nToken generated successfully\n");
    println!("Username:      {}", identity.username);
    println!("Device:        {}", identity.device_id());
    println!("Valid for:     {} hours", hours);
    println!("Expires:       {}", identity.expires_at.to_rfc3339());

    println!("\n{}", "=".repeat(70));
    println!("TOKEN:");
    println!("{}", "=".repeat(70));
    println!("{}", token);
    println!("{}\n", "=".repeat(70));

    println!("Usage:");
    println!(
        "  curl -H \"Authorization: Bearer {}\" http://localhost:8080/api/device/status",
        token
    );
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_generate_token_args() {
        let cli = Cli::try_parse_from([
            "emuhost",
            "generate-token",
            "--secret",
            "0123456789abcdef0123456789abcdef",
            "--username",
            "alice",
            "--hours",
            "2",
        ])
        .unwrap();

        match cli.command {
            Commands::GenerateToken {
                username, hours, ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(hours, 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_generate_token_rejects_short_secret() {
        assert!(generate_token("short", "alice", None, "emuhost", 1).is_err());
    }
}
