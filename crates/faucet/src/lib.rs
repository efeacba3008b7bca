//! Token faucet for Empe chains
//!
//! Funding requests are validated, rate limited per client and appended to a
//! durable queue. A background dispatcher periodically pays everything pending
//! in one multi-output transaction:
//! - Per-client fixed-window rate limiting persisted in sled
//! - Durable FIFO queue with independent duplicate entries
//! - Batch dispatch with all-or-nothing queue removal
//! - Prometheus metrics and a small HTTP API

pub mod api;
pub mod batch;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod fee;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod service;
pub mod validator;
pub mod wallet;

pub use config::FaucetConfig;
pub use database::FaucetDatabase;
pub use dispatcher::{CycleOutcome, DispatchSettings, DispatchState, Dispatcher, Ticker};
pub use error::{FaucetError, FaucetResult};
pub use service::{FaucetResponse, FaucetService, FaucetStatus};
