use std::{collections::HashSet, sync::Arc};

use mirror::{
    progress::parse_cancel_button_id, ChatPlatform, MirrorEngine, MirrorError, SupervisorError,
};
use shared::{
    domain::{ChannelId, MessageId, NewMirrorLink, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddLinkRequest, CancelInteractionRequest, CommandResponse, DeleteCommandRequest,
        MessageCommandRequest, MirrorSourcesResponse, UndoAutoDisableRequest,
    },
};
use storage::Storage;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub engine: MirrorEngine,
    pub platform: Arc<dyn ChatPlatform>,
    pub owners: Arc<HashSet<UserId>>,
}

pub async fn mirror_send(
    ctx: &ApiContext,
    req: MessageCommandRequest,
) -> Result<CommandResponse, ApiError> {
    ensure_owner(ctx, req.actor_id)?;
    let message = ctx
        .platform
        .fetch_message(req.channel_id, req.message_id)
        .await
        .map_err(|e| ApiError::new(ErrorCode::NotFound, format!("message not found: {e}")))?;
    let report = ctx
        .engine
        .on_message_created(message, false)
        .await
        .map_err(mirror_error)?;
    info!(
        actor_id = %req.actor_id,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "manual mirror send finished"
    );
    Ok(CommandResponse::new("Mirrored message."))
}

pub async fn mirror_update(
    ctx: &ApiContext,
    req: MessageCommandRequest,
) -> Result<CommandResponse, ApiError> {
    ensure_owner(ctx, req.actor_id)?;
    ctx.engine
        .on_message_updated(req.channel_id, req.message_id)
        .await
        .map_err(mirror_error)?;
    Ok(CommandResponse::new("Updated message."))
}

pub async fn mirror_delete(
    ctx: &ApiContext,
    req: DeleteCommandRequest,
) -> Result<CommandResponse, ApiError> {
    ensure_owner(ctx, req.actor_id)?;
    ctx.engine
        .on_message_deleted(None, req.message_id)
        .await
        .map_err(mirror_error)?;
    Ok(CommandResponse::new("Deleted messages."))
}

pub fn cancel_mirror(
    ctx: &ApiContext,
    actor_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
) -> Result<CommandResponse, ApiError> {
    ensure_owner(ctx, actor_id)?;
    match ctx.engine.cancel_update(channel_id, message_id) {
        Ok(cancelled) => {
            info!(%actor_id, %channel_id, %message_id, cancelled, "mirror cancelled");
            Ok(CommandResponse::new("Cancelled mirror"))
        }
        Err(err) => {
            warn!(%actor_id, %channel_id, %message_id, error = %err, "mirror cancel failed");
            let code = match err {
                SupervisorError::NoOperation => ErrorCode::NotFound,
                _ => ErrorCode::Conflict,
            };
            Err(ApiError::new(code, format!("Failed to cancel mirror: {err}")))
        }
    }
}

pub fn cancel_from_interaction(
    ctx: &ApiContext,
    req: CancelInteractionRequest,
) -> Result<CommandResponse, ApiError> {
    let key = parse_cancel_button_id(&req.custom_id)
        .ok_or_else(|| ApiError::new(ErrorCode::Validation, "unknown interaction"))?;
    cancel_mirror(ctx, req.actor_id, key.source_channel_id, key.source_message_id)
}

pub async fn mirror_sources(
    ctx: &ApiContext,
    destination: ChannelId,
) -> Result<MirrorSourcesResponse, ApiError> {
    ctx.engine
        .sources_for_destination(destination)
        .await
        .map_err(internal)
}

pub async fn add_link(ctx: &ApiContext, req: AddLinkRequest) -> Result<CommandResponse, ApiError> {
    ensure_owner(ctx, req.actor_id)?;
    if req.source_channel_id == req.destination_channel_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a channel cannot mirror into itself",
        ));
    }
    ctx.engine
        .add_link(NewMirrorLink {
            source_channel_id: req.source_channel_id,
            destination_channel_id: req.destination_channel_id,
            destination_server_id: Some(req.destination_server_id),
            is_legacy: true,
            enabled: true,
            role_mention_id: req.role_mention_id,
        })
        .await
        .map_err(internal)?;
    Ok(CommandResponse::new("Added mirror link."))
}

pub async fn undo_auto_disable(
    ctx: &ApiContext,
    req: UndoAutoDisableRequest,
) -> Result<CommandResponse, ApiError> {
    ensure_owner(ctx, req.actor_id)?;
    let restored = ctx
        .engine
        .undo_auto_disable(req.since)
        .await
        .map_err(internal)?;
    Ok(CommandResponse::new(format!(
        "Re-enabled {} mirror links.",
        restored.len()
    )))
}

fn ensure_owner(ctx: &ApiContext, actor_id: UserId) -> Result<(), ApiError> {
    if ctx.owners.contains(&actor_id) {
        Ok(())
    } else {
        warn!(%actor_id, "operator command refused");
        Err(ApiError::forbidden())
    }
}

fn mirror_error(err: MirrorError) -> ApiError {
    match err {
        MirrorError::Supervisor(SupervisorError::Conflict(key)) => ApiError::new(
            ErrorCode::Conflict,
            format!("an operation for {key} is already running"),
        ),
        other => ApiError::new(ErrorCode::Internal, other.to_string()),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
