use anyhow::Result;
use gridtrade_core::GridConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::commands::{CancelAllReport, EngineCommand, EngineStatus};

/// Clonable control-plane handle to the engine actor.
///
/// The kill flag is shared with the actor and set before the command is
/// even delivered, so an in-flight tick aborts at its next phase boundary.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    kill: Arc<AtomicBool>,
}

impl EngineHandle {
    #[must_use]
    pub fn new(tx: mpsc::Sender<EngineCommand>, kill: Arc<AtomicBool>) -> Self {
        Self { tx, kill }
    }

    /// # Errors
    /// Returns an error if the engine task is gone or reports a failure.
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Start { reply }).await?;
        rx.await?.map_err(|e| anyhow::anyhow!(e))
    }

    /// # Errors
    /// Returns an error if the engine task is gone.
    pub async fn pause(&self) -> Result<()> {
        self.tx.send(EngineCommand::Pause).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the engine task is gone.
    pub async fn resume(&self) -> Result<()> {
        self.tx.send(EngineCommand::Resume).await?;
        Ok(())
    }

    /// Highlander start: at most one market trades at a time.
    ///
    /// # Errors
    /// Returns an error if the switch fails; the previous market is left
    /// untouched in that case.
    pub async fn start_market(&self, market_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::StartMarket {
                market_id: market_id.to_string(),
                reply,
            })
            .await?;
        rx.await?.map_err(|e| anyhow::anyhow!(e))
    }

    /// # Errors
    /// Returns an error if the engine task is gone or the stop fails.
    pub async fn stop_market(&self, market_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::StopMarket {
                market_id: market_id.to_string(),
                reply,
            })
            .await?;
        rx.await?.map_err(|e| anyhow::anyhow!(e))
    }

    /// Kill switch. Sets the abort flag immediately, then has the engine
    /// cancel every open order and disable every market.
    ///
    /// # Errors
    /// Returns an error only if the engine task is gone; partial cancel
    /// failures are reported in the result and swept on later ticks.
    pub async fn cancel_all(&self) -> Result<CancelAllReport> {
        self.kill.store(true, Ordering::Release);
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::CancelAll { reply }).await?;
        Ok(rx.await?)
    }

    /// # Errors
    /// Returns an error if the engine task is gone or the reset fails.
    pub async fn reset_anchor(&self, market_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::ResetAnchor {
                market_id: market_id.to_string(),
                reply,
            })
            .await?;
        rx.await?.map_err(|e| anyhow::anyhow!(e))
    }

    /// Validates, persists, and hot-applies a replacement configuration.
    ///
    /// # Errors
    /// Returns an error if validation fails; the stored config is unchanged.
    pub async fn update_config(&self, config: GridConfig) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::UpdateConfig { config, reply })
            .await?;
        rx.await?.map_err(|e| anyhow::anyhow!(e))
    }

    /// # Errors
    /// Returns an error if the engine task is gone.
    pub async fn status(&self) -> Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::GetStatus { reply }).await?;
        Ok(rx.await?)
    }

    /// Graceful shutdown: the current tick finishes, then the actor exits.
    ///
    /// # Errors
    /// Returns an error if the engine task is already gone.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(EngineCommand::Shutdown).await?;
        Ok(())
    }
}
