//! Tally API server binary.
//!
//! Prints `{"port": N}` to stdout once the listener is bound so a supervisor
//! can discover an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tally_api::AppState;
use tally_api::config::ApiConfig;
use tally_core::auth::notify::LogNotifier;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI arguments for the API server.
#[derive(Parser, Debug)]
#[command(name = "tally_server", about = "Tally API server")]
struct Args {
    /// Port to listen on (0 = ephemeral). Overrides the port of `BIND_ADDR`.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// Keep everything in process memory instead of PostgreSQL.
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// Login attempts older than this many days are pruned.
    #[arg(
        long,
        env = "LOGIN_ATTEMPT_RETENTION_DAYS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u32).range(1..=3650)
    )]
    attempt_retention_days: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Write logs to stderr so stdout is reserved for the JSON port message.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tally_api=debug,tally_core=debug".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ApiConfig::from_env()?;
    if let Some(url) = args.database_url {
        config.pg_connection_url = url;
    }
    if let Some(port) = args.port {
        let host = config
            .bind_addr
            .rsplit_once(':')
            .map_or("127.0.0.1", |(host, _)| host);
        config.bind_addr = format!("{host}:{port}");
    }
    info!(?config, in_memory = args.in_memory, "starting tally_server");
    if !config.cookie_secure {
        warn!("COOKIE_SECURE is off; auth cookies will travel over plain HTTP");
    }

    let notifier = Arc::new(LogNotifier);
    let state = if args.in_memory {
        warn!("in-memory mode: all data is lost on exit");
        AppState::in_memory(config, notifier)?
    } else {
        info!(
            max_connections = args.max_connections,
            "configuring connection pool"
        );
        let pool = PgPoolOptions::new()
            .max_connections(args.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.pg_connection_url)
            .await?;

        info!("running database migrations");
        tally_api::migrate(&pool).await?;
        AppState::postgres(config, pool, notifier)?
    };

    let shutdown = CancellationToken::new();
    let housekeeping = tokio::spawn(housekeeping(
        state.clone(),
        args.attempt_retention_days,
        shutdown.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    println!("{}", serde_json::json!({"port": local_addr.port()}));
    info!(addr = %local_addr, "REST API listening");

    let app = tally_api::router(state);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                _ = shutdown.cancelled() => {}
            }
        }
    })
    .await;

    shutdown.cancel();
    let _ = housekeeping.await;
    result?;

    Ok(())
}

/// Prune old login attempts and idle rate-limit windows every ten minutes.
async fn housekeeping(state: AppState, retention_days: u32, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(600));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = chrono::Utc::now();
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));
        if let Err(e) = state.auth.guard().prune(cutoff, now).await {
            warn!(error = %e, "login attempt pruning failed");
        }
        state.rate_limiter.cleanup();
    }
}
