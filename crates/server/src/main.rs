use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use anyhow::anyhow;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mirror::{maintenance::spawn_mapping_prune, ChatPlatform, MirrorEngine, MirrorTopology};
use shared::{
    domain::ChannelId,
    error::{ApiError, ErrorCode},
    protocol::{
        AddLinkRequest, CancelInteractionRequest, CommandResponse, DeleteCommandRequest,
        MessageCommandRequest, MirrorSourcesResponse, PlatformEvent, UndoAutoDisableRequest,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod discord;
mod events;

use api::ApiContext;
use app_state::AppState;
use config::{load_settings, prepare_database_url};
use discord::DiscordPlatform;
use events::EventHub;

const MAX_EVENT_BYTES: usize = 1024 * 1024;
const EVENT_HUB_CAPACITY: usize = 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let token = settings
        .discord_token
        .clone()
        .ok_or_else(|| anyhow!("DISCORD_TOKEN is not set"))?;

    let events = EventHub::new(EVENT_HUB_CAPACITY);
    let platform: Arc<dyn ChatPlatform> = Arc::new(DiscordPlatform::new(
        &settings.discord_api_base,
        &token,
        events.clone(),
    )?);
    let topology: Arc<dyn MirrorTopology> = Arc::new(storage.clone());
    let mut engine = MirrorEngine::new(
        Arc::clone(&platform),
        Arc::clone(&topology),
        settings.mirror_settings(),
    );
    if let Some(bot_user_id) = settings.bot_user_id {
        engine = engine.with_bot_user(bot_user_id);
    }
    match engine.sources().refresh().await {
        Ok(count) => info!(sources = count, "loaded mirror source channels"),
        Err(err) => warn!(error = %format!("{err:#}"), "could not load mirror source channels"),
    }
    let prune = spawn_mapping_prune(
        topology,
        engine.settings().mapping_retention,
        engine.settings().prune_interval,
    );

    let api = ApiContext {
        storage,
        engine,
        platform,
        owners: Arc::new(settings.owner_ids.iter().copied().collect::<HashSet<_>>()),
    };
    let app = build_router(Arc::new(AppState { api, events }));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    prune.abort();
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/events",
            post(ingest_event).layer(RequestBodyLimitLayer::new(MAX_EVENT_BYTES)),
        )
        .route("/mirror/send", post(http_mirror_send))
        .route("/mirror/update", post(http_mirror_update))
        .route("/mirror/delete", post(http_mirror_delete))
        .route("/mirror/cancel", post(http_mirror_cancel))
        .route("/interactions/cancel", post(http_interaction_cancel))
        .route("/mirror/sources/:channel_id", get(http_mirror_sources))
        .route("/mirror/links", post(http_add_link))
        .route("/mirror/undo_auto_disable", post(http_undo_auto_disable))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            error!(error = %format!("{err:#}"), "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

/// Hands the event to publish waiters, then mirrors it in the background.
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<PlatformEvent>,
) -> StatusCode {
    let waiters = state.events.publish(event.clone());
    debug!(kind = ?event.kind(), channel_id = %event.channel_id(), waiters, "event ingested");

    let engine = state.api.engine.clone();
    tokio::spawn(async move {
        match engine.handle_event(event).await {
            Ok(Some(report)) => info!(
                key = %report.key,
                kind = %report.kind,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled.len(),
                "mirror operation finished"
            ),
            Ok(None) => {}
            Err(err) => error!(error = %err, "mirror operation failed"),
        }
    });
    StatusCode::ACCEPTED
}

async fn http_mirror_send(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessageCommandRequest>,
) -> ApiResult<CommandResponse> {
    api::mirror_send(&state.api, req).await.map(Json).map_err(reject)
}

async fn http_mirror_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessageCommandRequest>,
) -> ApiResult<CommandResponse> {
    api::mirror_update(&state.api, req).await.map(Json).map_err(reject)
}

async fn http_mirror_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteCommandRequest>,
) -> ApiResult<CommandResponse> {
    api::mirror_delete(&state.api, req).await.map(Json).map_err(reject)
}

async fn http_mirror_cancel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MessageCommandRequest>,
) -> ApiResult<CommandResponse> {
    api::cancel_mirror(&state.api, req.actor_id, req.channel_id, req.message_id)
        .map(Json)
        .map_err(reject)
}

async fn http_interaction_cancel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelInteractionRequest>,
) -> ApiResult<CommandResponse> {
    api::cancel_from_interaction(&state.api, req)
        .map(Json)
        .map_err(reject)
}

async fn http_mirror_sources(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<i64>,
) -> ApiResult<MirrorSourcesResponse> {
    api::mirror_sources(&state.api, ChannelId(channel_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_add_link(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddLinkRequest>,
) -> ApiResult<CommandResponse> {
    api::add_link(&state.api, req).await.map(Json).map_err(reject)
}

async fn http_undo_auto_disable(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UndoAutoDisableRequest>,
) -> ApiResult<CommandResponse> {
    api::undo_auto_disable(&state.api, req)
        .await
        .map(Json)
        .map_err(reject)
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
