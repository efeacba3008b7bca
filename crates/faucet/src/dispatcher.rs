//! Timer-driven batch dispatch.
//!
//! One cycle is `Idle -> SnapshotTaken -> Broadcasting -> Idle`. Only the
//! entries of the snapshot a landed batch was built from are removed; a failed
//! broadcast leaves the queue exactly as it was, and the next tick retries with
//! whatever is pending by then.

use crate::batch::{compose, BatchInstruction};
use crate::broadcast::{Broadcaster, TransactionResult};
use crate::config::FaucetConfig;
use crate::error::{FaucetError, FaucetResult};
use crate::fee::Fee;
use crate::metrics::FaucetMetrics;
use crate::queue::{EntryId, PendingEntries};
use crate::wallet::{SignerIdentity, Wallet};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// What every batch carries, fixed at startup
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub per_recipient_amount: u128,
    pub denom: String,
    pub fee: Fee,
    pub memo: String,
    /// Treat a broadcast that has not answered after this long as failed
    pub broadcast_timeout: Option<Duration>,
}

impl DispatchSettings {
    pub fn from_config(config: &FaucetConfig) -> FaucetResult<Self> {
        Ok(Self {
            per_recipient_amount: config.amount,
            denom: config.denom.clone(),
            fee: Fee::from_gas(config.gas_limit, &config.gas_price()?)?,
            memo: config.memo.clone(),
            broadcast_timeout: config.broadcast_timeout(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    SnapshotTaken,
    Broadcasting,
}

/// How a single cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was pending
    Empty,
    /// Another cycle held the dispatch guard
    Skipped,
    Succeeded {
        tx_hash: Option<String>,
        recipients: usize,
    },
    /// Queue untouched, retried on the next tick
    Failed { reason: String },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Empty => "empty",
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Succeeded { .. } => "succeeded",
            CycleOutcome::Failed { .. } => "failed",
        }
    }
}

/// Source of dispatch ticks
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. `false` means no more ticks will come.
    async fn tick(&mut self) -> bool;
}

#[async_trait]
impl Ticker for tokio::time::Interval {
    async fn tick(&mut self) -> bool {
        tokio::time::Interval::tick(self).await;
        true
    }
}

/// Manual ticks, one per message; closing the channel stops the dispatcher.
#[async_trait]
impl Ticker for mpsc::Receiver<()> {
    async fn tick(&mut self) -> bool {
        self.recv().await.is_some()
    }
}

pub struct Dispatcher {
    queue: Arc<dyn PendingEntries>,
    wallet: Arc<Wallet>,
    broadcaster: Arc<dyn Broadcaster>,
    settings: DispatchSettings,
    metrics: Arc<FaucetMetrics>,
    /// Held for a whole cycle. Guards the ids of a landed batch whose
    /// removal failed; they are cleared before anything else happens.
    cycle: Mutex<Vec<EntryId>>,
    state: watch::Sender<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        queue: impl PendingEntries + 'static,
        wallet: Arc<Wallet>,
        broadcaster: Arc<dyn Broadcaster>,
        settings: DispatchSettings,
        metrics: Arc<FaucetMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(DispatchState::Idle);
        Self {
            queue: Arc::new(queue),
            wallet,
            broadcaster,
            settings,
            metrics,
            cycle: Mutex::new(Vec::new()),
            state,
        }
    }

    pub fn state(&self) -> DispatchState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DispatchState> {
        self.state.subscribe()
    }

    /// Run one dispatch cycle unless another one is in progress.
    ///
    /// Errors never escape: they are logged and reported as
    /// [`CycleOutcome::Failed`].
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(mut leftover) = self.cycle.try_lock() else {
            debug!("Dispatch cycle still in progress, skipping tick");
            self.metrics.record_cycle(CycleOutcome::Skipped.label());
            return CycleOutcome::Skipped;
        };

        let outcome = match self.dispatch(&mut leftover).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_transient() {
                    warn!("Dispatch cycle failed, queue kept for next tick: {}", e);
                } else {
                    error!("Dispatch cycle failed, queue kept for next tick: {}", e);
                }
                CycleOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.state.send_replace(DispatchState::Idle);
        self.metrics.record_cycle(outcome.label());
        match self.queue.count().await {
            Ok(depth) => self.metrics.queue_depth.set(depth as i64),
            Err(e) => warn!("Cannot count pending entries: {}", e),
        }
        outcome
    }

    async fn dispatch(&self, leftover: &mut Vec<EntryId>) -> FaucetResult<CycleOutcome> {
        if !leftover.is_empty() {
            self.queue.remove_all(leftover).await?;
            info!(
                "Cleared {} entries of a previously landed batch",
                leftover.len()
            );
            leftover.clear();
        }

        let snapshot = self.queue.snapshot().await?;
        if snapshot.is_empty() {
            return Ok(CycleOutcome::Empty);
        }
        self.state.send_replace(DispatchState::SnapshotTaken);

        let identity = self.wallet.identity().await?;
        let batch = compose(
            identity.address(),
            &snapshot,
            self.settings.per_recipient_amount,
            &self.settings.denom,
        )?;

        self.state.send_replace(DispatchState::Broadcasting);
        info!(
            "Dispatching batch of {} recipients, {}{} total",
            batch.recipient_count(),
            batch.total(),
            self.settings.denom
        );

        let started = Instant::now();
        let result = self.broadcast(&identity, &batch).await;
        self.metrics
            .broadcast_duration
            .observe(started.elapsed().as_secs_f64());

        let result = result?;
        if !result.success {
            return Err(FaucetError::ChainRejection(result.details));
        }

        let ids: Vec<EntryId> = snapshot.iter().map(|entry| entry.id).collect();
        let recipients = ids.len();
        self.metrics.recipients_paid_total.inc_by(recipients as u64);

        if let Err(e) = self.queue.remove_all(&ids).await {
            error!(
                "Batch {} landed but clearing its {} entries failed, retrying next cycle: {}",
                result.tx_hash.as_deref().unwrap_or("<unknown>"),
                recipients,
                e
            );
            *leftover = ids;
        }

        info!(
            "Batch landed: tx {}, {} recipients",
            result.tx_hash.as_deref().unwrap_or("<unknown>"),
            recipients
        );
        Ok(CycleOutcome::Succeeded {
            tx_hash: result.tx_hash,
            recipients,
        })
    }

    async fn broadcast(
        &self,
        identity: &SignerIdentity,
        batch: &BatchInstruction,
    ) -> FaucetResult<TransactionResult> {
        let submit = self.broadcaster.submit(
            identity,
            identity.address(),
            batch,
            &self.settings.fee,
            &self.settings.memo,
        );

        match self.settings.broadcast_timeout {
            Some(limit) => tokio::time::timeout(limit, submit)
                .await
                .map_err(|_| FaucetError::Timeout(limit))?,
            None => submit.await,
        }
    }

    /// Run a cycle per tick until the ticker ends or `shutdown` flips to true.
    ///
    /// A cycle that has started always runs to completion, so shutdown waits
    /// for an in-flight broadcast.
    pub async fn run<T: Ticker>(self: Arc<Self>, mut ticker: T, mut shutdown: watch::Receiver<bool>) {
        info!("Dispatcher started");

        loop {
            tokio::select! {
                ticked = ticker.tick() => {
                    if !ticked {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.run_cycle().await;
        }

        info!("Dispatcher stopped");
    }
}
