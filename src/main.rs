//! Herald notification dispatch service.
//!
//! Wires configuration, the database pool, channel adapters, the dispatcher,
//! the feeder loop and the HTTP server, and coordinates shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{AppState, Config};
use herald_core::{storage::Storage, ChannelKind, Clock, RealClock};
use herald_dispatch::{
    channels::{EmailChannel, PushChannel, SmsChannel},
    storage::PostgresNotificationStore,
    worker::Feeder,
    ChannelRegistry, Dispatcher,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_retries = config.max_retries,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));
    let store = Arc::new(PostgresNotificationStore::new(storage));

    let registry = ChannelRegistry::new()
        .with(ChannelKind::Email, Arc::new(EmailChannel::new(config.to_email_config())?))
        .with(ChannelKind::Sms, Arc::new(SmsChannel::new(config.to_sms_config())?))
        .with(ChannelKind::Push, Arc::new(PushChannel::new(config.to_push_config())?));

    let dispatcher =
        Arc::new(Dispatcher::new(store, registry, config.to_dispatch_config(), clock.clone()));

    for (channel, healthy) in dispatcher.health_check().await {
        if healthy {
            info!(channel = %channel, "channel ready");
        } else {
            warn!(channel = %channel, "channel disabled or not configured");
        }
    }

    let shutdown = CancellationToken::new();

    let feeder = Feeder::new(
        dispatcher.clone(),
        config.to_feeder_config(),
        clock.clone(),
        shutdown.clone(),
    )
    .spawn();

    let addr = config.parse_server_addr()?;
    let state = AppState::new(dispatcher, clock).with_api_keys(config.api_keys.clone());
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        let request_timeout = config.request_timeout();
        async move {
            let result =
                herald_api::start_server(state, addr, request_timeout, shutdown.clone()).await;
            if let Err(e) = result {
                error!(error = %e, "server failed");
                shutdown.cancel();
            }
        }
    });

    info!(addr = %addr, "herald is ready to accept notifications");

    shutdown.cancelled().await;
    info!("shutdown signal received, waiting for feeder and server");

    let drained = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, async {
        if let Err(e) = feeder.await {
            error!(error = %e, "feeder task panicked");
        }
        if let Err(e) = server.await {
            error!(error = %e, "server task panicked");
        }
    })
    .await;

    if drained.is_err() {
        warn!("shutdown grace period expired");
    }

    db_pool.close().await;
    info!("herald shutdown complete");
    Ok(())
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Connects to the database, retrying while it comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the tables and indexes the repositories expect.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    let statements = [
        (
            "notifications table",
            r"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                channel TEXT NOT NULL,
                recipient TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                template_id UUID,
                template_data JSONB NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                scheduled_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TIMESTAMPTZ,
                delivered_at TIMESTAMPTZ,
                error_message TEXT,
                provider TEXT,
                metadata JSONB NOT NULL DEFAULT '{}'
            )
            ",
        ),
        (
            "audit_logs table",
            r"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id UUID PRIMARY KEY,
                notification_id UUID NOT NULL REFERENCES notifications(id),
                event_type TEXT NOT NULL,
                event_data JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL
            )
            ",
        ),
        (
            "templates table",
            r"
            CREATE TABLE IF NOT EXISTS templates (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                channel TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            ",
        ),
        (
            "due notifications index",
            r"
            CREATE INDEX IF NOT EXISTS idx_notifications_due
            ON notifications(created_at)
            WHERE status IN ('queued', 'pending')
            ",
        ),
        (
            "audit log index",
            r"
            CREATE INDEX IF NOT EXISTS idx_audit_logs_notification
            ON audit_logs(notification_id, created_at)
            ",
        ),
    ];

    for (name, sql) in statements {
        sqlx::query(sql).execute(pool).await.with_context(|| format!("failed to create {name}"))?;
    }

    Ok(())
}
