use gridtrade_core::{ExchangeAdapter, ExchangeError, OrderStatus, PlaceOrderRequest};
use gridtrade_store::Store;
use std::sync::Arc;

/// Outcome of an idempotent order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Order acknowledged by the exchange this call.
    Placed(String),
    /// A live order already carries this client tag.
    AlreadyLive(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("exchange: {0}")]
    Exchange(ExchangeError),
    #[error("store: {0}")]
    Store(anyhow::Error),
}

impl SubmitError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Exchange(e) => e.is_transient(),
            Self::Store(_) => false,
        }
    }
}

/// Places orders with write-ahead rows so every exchange-acknowledged order
/// has a store row, and every placement is idempotent by client tag.
///
/// Flow: insert a `PENDING_PLACE` row keyed by the tag, call the exchange,
/// promote the row to the exchange id on ACK. A crash or transient failure
/// between the steps leaves the pending row, and re-submitting with the
/// same tag resumes instead of duplicating.
#[derive(Clone)]
pub struct OrderSubmitter {
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
}

impl OrderSubmitter {
    #[must_use]
    pub fn new(store: Store, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self { store, adapter }
    }

    /// Submits `req`, linking the resulting order row to `lot_id` if given.
    ///
    /// # Errors
    /// Transient exchange errors leave the pending row for a later retry.
    /// Permanent errors mark the row `REJECTED`; the tag stays on it so a
    /// later submit can revive the row in place.
    pub async fn submit(
        &self,
        req: &PlaceOrderRequest,
        lot_id: Option<i64>,
    ) -> Result<SubmitOutcome, SubmitError> {
        let orders = self.store.orders();

        if let Some(existing) = orders
            .get_by_tag(&req.client_tag)
            .await
            .map_err(SubmitError::Store)?
        {
            match existing.status {
                OrderStatus::Open => {
                    return Ok(SubmitOutcome::AlreadyLive(existing.id));
                }
                OrderStatus::PendingPlace | OrderStatus::Unknown => {
                    // Resume the in-flight placement below.
                }
                OrderStatus::Filled => {
                    return Ok(SubmitOutcome::AlreadyLive(existing.id));
                }
                OrderStatus::Canceled | OrderStatus::Rejected => {
                    if existing.id == req.client_tag {
                        // The row never reached the exchange; retry it in
                        // place rather than inserting a duplicate.
                        orders
                            .reset_pending(&existing.id, req.price, req.size, lot_id)
                            .await
                            .map_err(SubmitError::Store)?;
                    } else {
                        // Exchange-keyed terminal order squatting on the
                        // tag: free it so the stable tag can be reused.
                        orders
                            .release_tag(&existing.id)
                            .await
                            .map_err(SubmitError::Store)?;
                    }
                }
            }
        }

        orders
            .insert_pending(
                &req.client_tag,
                &req.market_id,
                req.side,
                req.price,
                req.size,
                lot_id,
            )
            .await
            .map_err(SubmitError::Store)?;

        match self.adapter.place_limit_order(req).await {
            Ok(exchange_id) => {
                orders
                    .promote_to_open(&req.client_tag, &exchange_id)
                    .await
                    .map_err(SubmitError::Store)?;
                if let Some(lot) = lot_id {
                    orders
                        .set_lot(&exchange_id, lot)
                        .await
                        .map_err(SubmitError::Store)?;
                }
                Ok(SubmitOutcome::Placed(exchange_id))
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    tag = %req.client_tag,
                    error = %e,
                    "placement failed transiently, will retry"
                );
                Err(SubmitError::Exchange(e))
            }
            Err(e) => {
                // The row keeps its tag: a later submit with the same tag
                // finds the rejection and revives the row in place.
                tracing::error!(tag = %req.client_tag, error = %e, "placement rejected");
                orders
                    .set_status(&req.client_tag, OrderStatus::Rejected)
                    .await
                    .map_err(SubmitError::Store)?;
                Err(SubmitError::Exchange(e))
            }
        }
    }
}
