use crate::{api::ApiContext, events::EventHub};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: EventHub,
}
