//! Optik authentication API server binary.
//!
//! Loads `.env`, runs migrations, serves the auth routes and sweeps expired
//! sessions and shared-state keys in the background until Ctrl-C.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use optik_api::config::{ApiConfig, StateBackend};
use optik_core::auth::attempts::MemoryAttemptLog;
use optik_core::auth::credentials::MemoryCredentialStore;
use optik_core::auth::password::PasswordHasher;
use optik_core::auth::service::{AuthBackends, AuthService};
use optik_core::clock::system_clock;
use optik_core::config::AuthConfig;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI arguments for the API server.
#[derive(Parser, Debug)]
#[command(name = "optik_api_server", about = "Optik authentication API server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3100")]
    bind: String,

    /// PostgreSQL connection URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/optik"
    )]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 10)]
    max_connections: u32,

    /// Where sessions, counters and credentials live: `postgres` or `memory`.
    #[arg(long, env = "STATE_BACKEND", default_value_t = StateBackend::Postgres)]
    state_backend: StateBackend,

    /// Reverse proxies allowed to set `x-forwarded-for` / `x-real-ip`.
    #[arg(long, env = "TRUSTED_PROXIES", value_delimiter = ',')]
    trusted_proxies: Vec<IpAddr>,

    /// Seconds between sweeps of expired sessions and shared-state keys.
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 300)]
    sweep_interval_secs: u64,

    /// Print the bcrypt hash of this password and exit.
    #[arg(long, value_name = "PASSWORD")]
    hash_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,optik_api=debug,optik_core=debug")
            }),
        )
        .init();

    let args = Args::parse();
    let auth_config = AuthConfig::from_env();

    if let Some(password) = args.hash_password.as_deref() {
        let hash = PasswordHasher::new(auth_config.bcrypt_cost)
            .hash(password)
            .await?;
        println!("{hash}");
        return Ok(());
    }

    auth_config.validate()?;
    info!(
        bind = %args.bind,
        backend = %args.state_backend,
        "starting optik_api_server"
    );

    let clock = system_clock();
    let backends = match args.state_backend {
        StateBackend::Postgres => {
            info!(max_connections = args.max_connections, "configuring connection pool");
            let pool = PgPoolOptions::new()
                .max_connections(args.max_connections)
                .acquire_timeout(Duration::from_secs(30))
                .connect(&args.database_url)
                .await?;

            info!("running database migrations");
            optik_api::migrate(&pool).await?;
            AuthBackends::postgres(pool, &auth_config)
        }
        StateBackend::Memory => {
            warn!("memory backend: no users, state is lost on restart, limits are per process");
            AuthBackends::in_memory(
                MemoryCredentialStore::new(),
                MemoryAttemptLog::new(),
                clock.clone(),
                &auth_config,
            )
        }
    };

    let auth = Arc::new(AuthService::new(auth_config, clock, backends));
    let config = ApiConfig {
        bind_addr: args.bind,
        database_url: args.database_url,
        state_backend: args.state_backend,
        trusted_proxies: args.trusted_proxies,
    };

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep(
        auth.clone(),
        Duration::from_secs(args.sweep_interval_secs.max(1)),
        shutdown.clone(),
    ));

    let app = optik_api::router(optik_api::AppState {
        auth,
        config: config.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        }
    })
    .await;

    shutdown.cancel();
    let _ = sweeper.await;

    serve_result?;

    Ok(())
}

/// Periodically purge expired sessions and shared-state keys.
async fn sweep(auth: Arc<AuthService>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match auth.purge_expired().await {
                Ok(report) => info!(
                    shared_keys = report.shared_keys,
                    sessions = report.sessions,
                    "swept expired state"
                ),
                Err(e) => warn!(error = %e, "sweep failed"),
            },
        }
    }
}
