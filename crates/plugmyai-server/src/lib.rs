//! HTTP surface of the plug-my-ai daemon.

pub mod auth;
pub mod completions;
pub mod error;
mod handlers;
pub mod notify;
pub mod pairing;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::Method;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::routing::{delete, get, post};
use chrono::Utc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use plugmyai_core::Config;
use plugmyai_providers::{Registry, builtin_constructors};
use plugmyai_store::Store;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub use auth::Caller;
pub use error::{ApiError, StartError};
pub use notify::{ApprovalSurface, BrowserApproval, LogOnlyApproval};
pub use pairing::{DecisionHandle, Pairing};

static METRICS: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<Store>,
    pub pairing: Arc<Pairing>,
    pub config: Arc<RwLock<Config>>,
    pub admin_token: Arc<str>,
    /// Port actually bound, used in pairing URLs.
    pub port: u16,
    pub request_timeout: Duration,
    pub started_at: Instant,
    pub started_unix: i64,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(handlers::status))
        .route("/v1/models", get(handlers::models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/connect", post(handlers::connect))
        .route("/v1/connect/pending", get(handlers::connect_pending))
        .route("/v1/connect/:id", get(handlers::connect_poll))
        .route("/v1/connect/:id/approve", post(handlers::connect_approve))
        .route("/v1/connect/:id/deny", post(handlers::connect_deny))
        .route("/v1/connect/:id/providers", get(handlers::connect_providers))
        .route(
            "/v1/history",
            get(handlers::history_list).delete(handlers::history_delete),
        )
        .route("/v1/history/:id", get(handlers::history_get))
        .route("/v1/providers", get(handlers::providers))
        .route("/v1/apps", get(handlers::apps_list))
        .route("/v1/apps/:id", delete(handlers::apps_revoke))
        .route("/v1/onboarding/status", get(handlers::onboarding_status))
        .route(
            "/v1/onboarding/test-provider",
            post(handlers::onboarding_test_provider),
        )
        .route("/v1/onboarding/complete", post(handlers::onboarding_complete))
        .route("/metrics", get(handlers::metrics_endpoint))
        .layer(cors())
        .with_state(state)
}

/// Browser apps on any origin may call the API; the bearer token is the
/// access control.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(86_400))
}

fn metrics_handle() -> PrometheusHandle {
    METRICS
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(e) = metrics::set_boxed_recorder(Box::new(recorder)) {
                warn!(error = %e, "metrics recorder already installed");
            }
            handle
        })
        .clone()
}

/// Open the store, build the provider registry and serve on
/// `127.0.0.1:{cfg.port}` (port 0 picks a free one).
pub async fn start(
    cfg: Config,
    surface: Arc<dyn ApprovalSurface>,
) -> Result<(SocketAddr, JoinHandle<()>), StartError> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
    let metrics = metrics_handle();

    let store = Arc::new(Store::open(&cfg.database_path())?);
    let registry = Arc::new(Registry::build(&cfg.providers, &builtin_constructors()));
    for provider in registry.all() {
        let available = provider.available().await;
        info!(provider = provider.id(), available, "provider ready");
    }

    let listener = TcpListener::bind(("127.0.0.1", cfg.port)).await?;
    let addr = listener.local_addr()?;

    let pairing = Arc::new(Pairing::new(
        store.clone(),
        registry.clone(),
        surface,
        Duration::from_secs(cfg.connect_ttl_secs),
        addr.port(),
    ));
    let state = AppState {
        registry,
        store,
        pairing,
        admin_token: Arc::from(cfg.admin_token.as_str()),
        port: addr.port(),
        request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        config: Arc::new(RwLock::new(cfg)),
        started_at: Instant::now(),
        started_unix: Utc::now().timestamp(),
        metrics,
    };
    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "server stopped");
        }
    });
    info!("listening on {}", addr);
    Ok((addr, handle))
}
