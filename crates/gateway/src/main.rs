//! Bissy API Gateway
//!
//! The HTTP surface of the query result cache.
//! Handles:
//! - Authentication (JWT bearer tokens and API keys)
//! - Rate limiting
//! - Request routing
//! - Observability (logging, metrics, tracing)

mod handlers;
mod middleware;

use axum::{
    extract::FromRef,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use bissy_common::{
    auth::Authenticator,
    cache::{InMemoryCache, RedisCache, ResultCache},
    clock::{Clock, IdGenerator, SystemClock, UuidGenerator},
    config::{AppConfig, CacheBackend},
    db::DbPool,
    executor::DriverRegistry,
    metrics::{self, EXECUTION_BUCKETS, LATENCY_BUCKETS},
    store::{
        ApiKeyStore, DatasourceStore, InMemoryApiKeyStore, InMemoryDatasourceStore,
        InMemoryQueryStore, QueryStore,
    },
    Repository, ResultService,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Present only when the SQL-backed stores are in use
    pub db: Option<DbPool>,
    pub datasources: Arc<dyn DatasourceStore>,
    pub queries: Arc<dyn QueryStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub cache: Arc<dyn ResultCache>,
    pub results: Arc<ResultService>,
    pub auth: Arc<Authenticator>,
    pub metrics: Option<PrometheusHandle>,
}

impl FromRef<AppState> for Arc<Authenticator> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Arc::new(AppConfig::load()?);

    init_tracing(&config);

    info!(
        service = %config.observability.service_name,
        "Starting Bissy API Gateway v{}",
        bissy_common::VERSION
    );

    // Initialize metrics
    let metrics_handle = if config.observability.metrics_enabled {
        let handle = install_metrics_recorder()?;
        metrics::register_metrics();
        Some(handle)
    } else {
        None
    };

    let state = build_state(config.clone(), metrics_handle).await?;

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.shutdown_timeout()))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Suffix("execution_duration_seconds".to_string()),
            EXECUTION_BUCKETS,
        )?
        .install_recorder()?;
    Ok(handle)
}

/// Wire stores, cache, drivers and the authenticator from configuration
async fn build_state(
    config: Arc<AppConfig>,
    metrics: Option<PrometheusHandle>,
) -> anyhow::Result<AppState> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);

    // Stores
    let (db, datasources, queries, api_keys) = if config.database.url.is_some() {
        info!("Connecting to database...");
        let db = DbPool::new(&config.database).await?;
        let repo = Arc::new(Repository::new(db.clone(), clock.clone(), ids.clone()));
        let datasources: Arc<dyn DatasourceStore> = repo.clone();
        let queries: Arc<dyn QueryStore> = repo.clone();
        let api_keys: Arc<dyn ApiKeyStore> = repo;
        (Some(db), datasources, queries, api_keys)
    } else {
        warn!("database.url is not set, using in-memory stores");
        let datasources: Arc<dyn DatasourceStore> =
            Arc::new(InMemoryDatasourceStore::new(clock.clone(), ids.clone()));
        let queries: Arc<dyn QueryStore> =
            Arc::new(InMemoryQueryStore::new(clock.clone(), ids.clone()));
        let api_keys: Arc<dyn ApiKeyStore> =
            Arc::new(InMemoryApiKeyStore::new(clock.clone(), ids));
        (None, datasources, queries, api_keys)
    };

    // Result cache
    let cache: Arc<dyn ResultCache> = match config.cache.backend {
        CacheBackend::Memory => Arc::new(InMemoryCache::new()),
        CacheBackend::Redis => {
            info!("Connecting to Redis...");
            Arc::new(RedisCache::new(&config.cache).await?)
        }
    };
    info!(backend = cache.name(), "Result cache ready");

    let executors = Arc::new(DriverRegistry::new(config.executor.clone()));
    let results = Arc::new(
        ResultService::new(
            queries.clone(),
            datasources.clone(),
            cache.clone(),
            executors,
            clock.clone(),
        )
        .with_execution_timeout(config.execution_timeout()),
    );

    let secret = jwt_secret(&config)?;
    let auth = Arc::new(Authenticator::new(
        &config.auth,
        &secret,
        api_keys.clone(),
        clock,
    )?);

    Ok(AppState {
        config,
        db,
        datasources,
        queries,
        api_keys,
        cache,
        results,
        auth,
        metrics,
    })
}

/// Configured secret, or a throwaway one in development
fn jwt_secret(config: &AppConfig) -> anyhow::Result<String> {
    if let Some(secret) = config.auth.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
        return Ok(secret.to_string());
    }

    let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
    if env != "development" {
        anyhow::bail!("auth.jwt_secret must be set when APP_ENV={}", env);
    }

    warn!("auth.jwt_secret is not set, using a random secret; tokens will not survive a restart");
    Ok(rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let mut api_routes = Router::new()
        // Datasource endpoints
        .route(
            "/datasources",
            get(handlers::datasources::list_datasources)
                .post(handlers::datasources::create_datasource),
        )
        .route(
            "/datasources/{id}",
            get(handlers::datasources::get_datasource)
                .patch(handlers::datasources::update_datasource)
                .delete(handlers::datasources::delete_datasource),
        )
        // Query endpoints
        .route(
            "/queries",
            get(handlers::queries::list_queries).post(handlers::queries::create_query),
        )
        .route(
            "/queries/{id}",
            get(handlers::queries::get_query)
                .patch(handlers::queries::update_query)
                .delete(handlers::queries::delete_query),
        )
        .route("/queries/{id}/result", get(handlers::queries::get_result))
        // API key endpoints
        .route(
            "/apikeys",
            get(handlers::apikeys::list_api_keys).post(handlers::apikeys::create_api_key),
        )
        .route("/apikeys/{id}", axum::routing::delete(handlers::apikeys::delete_api_key));

    if state.config.rate_limit.enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(&state.config.rate_limit);
        api_routes = api_routes.layer(from_fn_with_state(
            limiter,
            middleware::rate_limit::rate_limit_middleware,
        ));
    }

    // Probes stay outside the rate limit
    let ops_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics));

    let request_timeout = state.config.request_timeout();

    // Compose the app
    Router::new()
        .merge(api_routes)
        .merge(ops_routes)
        .layer(from_fn(middleware::metrics::track_requests))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler; forces exit once the grace period lapses
async fn shutdown_signal(grace: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out, exiting");
        std::process::exit(1);
    });
}

#[cfg(test)]
mod tests;
