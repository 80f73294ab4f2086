use gridtrade_core::ExchangeAdapter;
use gridtrade_engine::{EngineHandle, EventBus};
use gridtrade_store::Store;
use std::sync::Arc;

/// Deployment facts surfaced by `GET /api/bot/status`.
#[derive(Debug, Clone)]
pub struct EnvInfo {
    pub env: String,
    pub exchange_type: String,
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub handle: EngineHandle,
    pub store: Store,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub bus: EventBus,
    pub env: EnvInfo,
}
