//! Request handling: validation, admission, enqueue

use crate::clock::{Clock, SystemClock};
use crate::config::FaucetConfig;
use crate::database::FaucetDatabase;
use crate::dispatcher::DispatchState;
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::FaucetMetrics;
use crate::queue::DurableQueue;
use crate::rate_limit::RateLimiter;
use crate::validator::{self, AddressValidator};
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Process-wide request ceiling
type GlobalLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Body of every funding response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaucetResponse {
    /// `success` or `error`
    pub status: String,
    pub message: String,
}

impl FaucetResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Faucet status
#[derive(Debug, Clone, Serialize)]
pub struct FaucetStatus {
    pub faucet_address: String,
    pub chain_id: String,
    pub denom: String,
    pub amount_per_recipient: String,
    pub pending_requests: usize,
    pub dispatcher: DispatchState,
    pub dispatch_interval_secs: u64,
    pub rate_limit_window_secs: u64,
    pub max_requests_per_window: u32,
}

/// Faucet service
pub struct FaucetService {
    config: FaucetConfig,
    faucet_address: String,
    queue: DurableQueue,
    limiter: RateLimiter,
    validator: Arc<dyn AddressValidator>,
    clock: Arc<dyn Clock>,
    metrics: Arc<FaucetMetrics>,
    global_limiter: Option<GlobalLimiter>,
}

impl FaucetService {
    /// Create new faucet service. `faucet_address` is the disbursing wallet,
    /// quoted back to clients.
    pub fn new(
        config: FaucetConfig,
        database: &FaucetDatabase,
        faucet_address: String,
        metrics: Arc<FaucetMetrics>,
    ) -> FaucetResult<Self> {
        let global_limiter = NonZeroU32::new(config.global_requests_per_minute).map(|rpm| {
            info!("Global request ceiling: {} per minute", rpm);
            GovernorLimiter::direct(Quota::per_minute(rpm))
        });

        Ok(Self {
            validator: validator::from_config(&config),
            queue: database.queue()?,
            limiter: database.rate_limiter()?,
            clock: Arc::new(SystemClock),
            config,
            faucet_address,
            metrics,
            global_limiter,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn AddressValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &FaucetConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.rate_limit_window_secs as i64)
    }

    /// Handle one funding request and fold the result into a response body.
    pub async fn handle(
        &self,
        raw_address: &str,
        client_key: &str,
        now: DateTime<Utc>,
    ) -> FaucetResponse {
        match self.admit(raw_address, client_key, now).await {
            Ok(message) => FaucetResponse::success(message),
            Err(e) => FaucetResponse::error(e.to_string()),
        }
    }

    /// Validate, count and enqueue. On success the address is durably queued
    /// and the confirmation message is returned.
    pub async fn admit(
        &self,
        raw_address: &str,
        client_key: &str,
        now: DateTime<Utc>,
    ) -> FaucetResult<String> {
        let result = self.try_admit(raw_address, client_key, now).await;
        self.metrics.record_request(request_outcome(&result));
        result
    }

    async fn try_admit(
        &self,
        raw_address: &str,
        client_key: &str,
        now: DateTime<Utc>,
    ) -> FaucetResult<String> {
        debug!("Funding request from {} for {}", client_key, raw_address);

        if !self.validator.is_valid(raw_address) {
            return Err(FaucetError::InvalidAddress(raw_address.to_string()));
        }

        if let Some(global) = &self.global_limiter {
            if global.check().is_err() {
                warn!("Global request ceiling reached, turning away {}", client_key);
                return Err(FaucetError::Busy);
            }
        }

        let window = self.window();
        let record = self
            .limiter
            .check_and_increment(client_key, now, window)
            .await?;

        let limit = self.config.max_requests_per_window;
        if record.count > limit {
            let remaining = record.remaining(now, window);
            // Round up so a client retrying on the dot is inside the new window.
            let retry_after_secs = (remaining.num_milliseconds().max(0) as u64).div_ceil(1000);
            debug!("{} is rate limited ({} > {})", client_key, record.count, limit);
            return Err(FaucetError::RateLimitExceeded {
                count: record.count,
                limit,
                window_secs: self.config.rate_limit_window_secs,
                retry_after_secs,
            });
        }

        let id = self.queue.enqueue(raw_address).await?;
        self.metrics.queue_depth.inc();
        info!("Queued {} as entry {}", raw_address, id);

        Ok(format!(
            "Success, your address {} will receive funds shortly from {}",
            raw_address, self.faucet_address
        ))
    }

    pub async fn status(&self, dispatcher: DispatchState) -> FaucetResult<FaucetStatus> {
        Ok(FaucetStatus {
            faucet_address: self.faucet_address.clone(),
            chain_id: self.config.chain_id.clone(),
            denom: self.config.denom.clone(),
            amount_per_recipient: self.config.amount.to_string(),
            pending_requests: self.queue.count().await?,
            dispatcher,
            dispatch_interval_secs: self.config.dispatch_interval_secs,
            rate_limit_window_secs: self.config.rate_limit_window_secs,
            max_requests_per_window: self.config.max_requests_per_window,
        })
    }

    /// Drop rate limit records whose window has expired
    pub async fn reap_stale_records(&self) -> FaucetResult<usize> {
        self.limiter.reap_expired(self.now(), self.window()).await
    }

    /// Reap every `interval` until `shutdown` flips to true
    pub async fn run_reaper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_stale_records().await {
                        warn!("Rate limit reaping failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn request_outcome(result: &FaucetResult<String>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(FaucetError::InvalidAddress(_)) | Err(FaucetError::InvalidRequest(_)) => "invalid",
        Err(FaucetError::RateLimitExceeded { .. }) => "rate_limited",
        Err(FaucetError::Busy) => "busy",
        Err(_) => "error",
    }
}
