use anyhow::{Context, Result};
use cdc_relay_service::checkpoint::{KvStore, PgKvStore, RedisKvStore};
use cdc_relay_service::config::{EngineKind, RelayConfig};
use cdc_relay_service::engine::{ConnectRetry, EngineFactory, KafkaEngineFactory};
use cdc_relay_service::flags::{FeatureFlags, RedisFeatureFlags, StaticFeatureFlags};
use cdc_relay_service::http;
use cdc_relay_service::lock::{DistributedLockService, RedisLockBackend};
use cdc_relay_service::metrics::RelayMetrics;
use cdc_relay_service::publisher::{KafkaProducerBuilder, PublisherFactory};
use cdc_relay_service::supervisor::{RelayDependencies, Supervisor, TokioExecutor};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_relay_service=debug".into());

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> Result<()> {
    init_tracing();
    info!("Starting cdc-relay-service");

    let config = RelayConfig::from_env().context("Failed to load configuration")?;

    // Configuration errors stop the process before any worker exists.
    let collections = config
        .collection_configs()
        .context("Invalid collection configuration")?;
    info!(
        connector = %config.connector_name,
        collections = collections.len(),
        "Configuration loaded"
    );

    // One worker per collection plus room for the HTTP server and lease refreshes.
    let worker_threads = (collections.len() + 1).max(2);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("cdc-relay-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: RelayConfig) -> Result<()> {
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let redis = ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to Redis")?;
    info!("Redis connection established");

    let store: Arc<dyn KvStore> = match config.database_url.as_deref() {
        Some(url) if !url.is_empty() => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let store = PgKvStore::new(pool);
            store
                .initialize()
                .await
                .context("Failed to initialize offsets table")?;
            info!("Checkpoints stored in PostgreSQL");
            Arc::new(store)
        }
        _ => {
            info!("Checkpoints stored in Redis");
            Arc::new(RedisKvStore::new(redis.clone()))
        }
    };

    let retry = ConnectRetry {
        attempts: config.connect_retry_attempts,
        min_backoff: Duration::from_millis(config.connect_retry_min_backoff_ms),
        max_backoff: Duration::from_millis(config.connect_retry_max_backoff_ms),
    };
    let engines: Arc<dyn EngineFactory> = match config.engine_kind()? {
        EngineKind::Kafka => Arc::new(KafkaEngineFactory::new(
            config.source_brokers().to_string(),
            store,
            retry,
        )),
    };

    let producers = KafkaProducerBuilder::new(
        config.kafka_brokers.clone(),
        config.connector_name.clone(),
        config.kafka_send_timeout(),
    );
    let flags: Arc<dyn FeatureFlags> = Arc::new(RedisFeatureFlags::new(
        redis.clone(),
        config.flag_key_prefix.clone(),
        StaticFeatureFlags::new(config.disabled_flag_pairs()),
    ));

    let deps = RelayDependencies {
        locks: DistributedLockService::new(Arc::new(RedisLockBackend::new(redis.clone()))),
        engines,
        publishers: Arc::new(PublisherFactory::new(Arc::new(producers))),
        flags,
        metrics: RelayMetrics::new(),
    };

    let supervisor = Supervisor::new();
    let workers = supervisor.start(&config, deps, &TokioExecutor::current())?;
    info!(workers, "Supervisor started");

    info!("Starting HTTP server on 0.0.0.0:{}", config.http_port);
    let server = http::server(supervisor.registry(), config.http_port)
        .context("Failed to bind HTTP server")?;
    let server_handle = server.handle();
    let mut server_task = tokio::spawn(server);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        res = &mut server_task => {
            warn!("HTTP server exited unexpectedly: {:?}", res);
        }
    }

    let result = supervisor.shutdown(config.shutdown_grace()).await;
    if let Err(e) = &result {
        error!("Shutdown incomplete: {}", e);
    }

    server_handle.stop(true).await;
    if !server_task.is_finished() {
        server_task.abort();
    }

    info!("cdc-relay-service stopped");
    result.map_err(Into::into)
}
