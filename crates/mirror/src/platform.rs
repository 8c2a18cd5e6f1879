use std::time::Duration;

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ChannelInfo, MessageId, MessageSnapshot, OutboundMessage},
    protocol::{PlatformEvent, PlatformEventKind},
};
use thiserror::Error;

/// How a platform failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The requested effect is already in place.
    AlreadyDone,
    /// Worth retrying later.
    Transient,
    /// Will not succeed without operator action.
    Terminal,
}

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request ({code:?}): {message}")]
    BadRequest { code: Option<u32>, message: String },
    #[error("message has already been crossposted")]
    AlreadyCrossposted,
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("transient platform error: {0}")]
    Transient(String),
}

impl PlatformError {
    pub fn class(&self) -> FailureClass {
        match self {
            PlatformError::AlreadyCrossposted => FailureClass::AlreadyDone,
            PlatformError::RateLimited { .. } | PlatformError::Transient(_) => {
                FailureClass::Transient
            }
            PlatformError::Forbidden(_)
            | PlatformError::NotFound(_)
            | PlatformError::BadRequest { .. } => FailureClass::Terminal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

pub type EventPredicate = Box<dyn Fn(&PlatformEvent) -> bool + Send + Sync>;

/// The chat platform as seen by the relay.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: &OutboundMessage,
    ) -> Result<MessageId, PlatformError>;

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError>;

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), PlatformError>;

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<MessageSnapshot, PlatformError>;

    async fn fetch_channel(&self, channel_id: ChannelId) -> Result<ChannelInfo, PlatformError>;

    async fn crosspost_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), PlatformError>;

    /// Resolves with the first matching event, or `None` once `timeout` elapses.
    async fn wait_for_event(
        &self,
        kind: PlatformEventKind,
        predicate: EventPredicate,
        timeout: Duration,
    ) -> Result<Option<PlatformEvent>, PlatformError>;
}
