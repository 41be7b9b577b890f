use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use oncall_config::Config;
use oncall_contracts::{
    ErrorResponse, OnCallView, ResolveError, RewriteRequest, RewriteResponse, TeamMentionConfig,
    TeamsInstalled,
};
use tracing::{info, warn};

pub mod cache;
pub mod opsgenie;
pub mod resolver;
pub mod rewriter;
pub mod store;

pub use cache::OnCallCache;
pub use opsgenie::OpsgenieClient;
pub use resolver::{IdentityMapper, PassthroughIdentity, Resolver, ScheduleClient};
pub use rewriter::{Rewriter, TeamSet};
pub use store::{KvStore, MemoryKv, SqliteKv};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(cfg)?;
    let warm = state.rewriter.clone();
    tokio::spawn(async move { warm.warm_up().await });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "oncall-mention listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(router(AppState::new(cfg)?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/rewrite", post(rewrite))
        .route("/v1/oncall/{mention}", get(on_call))
        .route("/v1/teams", get(list_teams).put(replace_teams))
        .route("/v1/cache/clear", post(clear_cache))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[derive(Clone)]
pub struct AppState {
    rewriter: Rewriter,
}

impl AppState {
    pub fn new(cfg: Config) -> Result<Self, String> {
        let api_key = cfg
            .opsgenie
            .resolved_api_key()
            .ok_or_else(|| "opsgenie api key is not configured".to_string())?;
        let client = Arc::new(OpsgenieClient::new(
            &cfg.opsgenie.api_url,
            &api_key,
            &cfg.identity.attribute,
        )?);
        let identities: Arc<dyn IdentityMapper> = if cfg.identity.mode == "passthrough" {
            Arc::new(PassthroughIdentity)
        } else {
            client.clone()
        };
        let resolver = Resolver::new(
            client,
            identities,
            Duration::from_millis(cfg.opsgenie.timeout_ms),
        )
        .with_retry(
            cfg.opsgenie.retry_max_attempts,
            Duration::from_millis(cfg.opsgenie.retry_backoff_ms),
        );

        let kv: Arc<dyn KvStore> = Arc::from(store::open_store(&cfg)?);
        let cache = OnCallCache::new().with_store(kv, cfg.store.retention_secs);

        Ok(Self::from_parts(
            TeamSet::new(cfg.teams),
            cache,
            resolver,
            Duration::from_millis(cfg.cache.ttl_ms),
        ))
    }

    pub fn from_parts(
        teams: TeamSet,
        cache: OnCallCache,
        resolver: Resolver,
        ttl: Duration,
    ) -> Self {
        Self {
            rewriter: Rewriter::new(teams, Arc::new(cache), Arc::new(resolver), ttl),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(code, message)))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn rewrite(
    State(state): State<AppState>,
    Json(input): Json<RewriteRequest>,
) -> Json<RewriteResponse> {
    let message = state.rewriter.rewrite(&input.message).await;
    Json(RewriteResponse { message })
}

async fn on_call(
    State(state): State<AppState>,
    Path(mention): Path<String>,
) -> Result<Json<OnCallView>, ApiError> {
    let mention = mention.trim_start_matches('@').to_string();
    match state.rewriter.on_call(&mention).await {
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "unknown_mention",
            format!("no team is configured for @{mention}"),
        )),
        Some(Ok(result)) => Ok(Json(OnCallView {
            mention,
            identities: result.identities,
            fetched_at: result.fetched_at,
        })),
        Some(Err(err)) => Err(resolve_failed(&err)),
    }
}

fn resolve_failed(err: &ResolveError) -> ApiError {
    let status = match err {
        ResolveError::Unauthorized(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    api_error(status, err.code(), err.to_string())
}

async fn list_teams(State(state): State<AppState>) -> Json<Vec<TeamMentionConfig>> {
    Json(state.rewriter.teams().snapshot().as_ref().clone())
}

async fn replace_teams(
    State(state): State<AppState>,
    Json(teams): Json<Vec<TeamMentionConfig>>,
) -> Result<Json<TeamsInstalled>, ApiError> {
    oncall_config::validate_teams(&teams)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_teams", e.to_string()))?;
    let installed = teams.len();
    state.rewriter.teams().replace(teams);
    info!(teams = installed, "installed new team set");
    Ok(Json(TeamsInstalled { teams: installed }))
}

async fn clear_cache(State(state): State<AppState>) -> StatusCode {
    state.rewriter.cache().clear();
    info!("cleared on-call cache");
    StatusCode::NO_CONTENT
}
