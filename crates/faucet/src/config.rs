//! Faucet configuration

use crate::error::{FaucetError, FaucetResult};
use crate::fee::GasPrice;
use crate::wallet::DerivationParams;
use empe_common::utils::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Secret material that never shows up in `Debug` output.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Which address predicate guards the request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressValidation {
    /// Full bech32 decode with the configured prefix and a 20-byte payload
    Bech32,
    /// Prefix and total length only
    PrefixLength,
}

impl std::str::FromStr for AddressValidation {
    type Err = FaucetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bech32" => Ok(AddressValidation::Bech32),
            "prefix_length" | "prefix-length" => Ok(AddressValidation::PrefixLength),
            other => Err(FaucetError::Config(format!(
                "Unknown address validation mode: {}",
                other
            ))),
        }
    }
}

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// Server address
    pub server_addr: String,

    /// JSON-RPC endpoint of the signing relay that serves
    /// `broadcast_signed_batch`. A node's own RPC port does not.
    pub rpc_url: String,

    /// Chain the batches are signed for
    pub chain_id: String,

    /// Faucet wallet secret phrase
    pub mnemonic: Secret,

    /// Mixed into the faucet key derivation so one phrase can back several
    /// accounts. Only salts the derivation: the result is not the BIP-32
    /// account a wallet would derive from the same phrase and path.
    pub hd_path: String,

    /// Bech32 human readable prefix of chain addresses
    pub address_prefix: String,

    /// Token denomination
    pub denom: String,

    /// Amount paid to every queued recipient
    pub amount: u128,

    /// Seconds between dispatch cycles
    pub dispatch_interval_secs: u64,

    /// Rate limit: time window in seconds
    pub rate_limit_window_secs: u64,

    /// Rate limit: maximum requests per time window
    pub max_requests_per_window: u32,

    /// Seconds between sweeps of expired rate limit records, 0 keeps them forever
    pub rate_limit_reap_interval_secs: u64,

    /// Process-wide request ceiling per minute, 0 disables it
    pub global_requests_per_minute: u32,

    /// Gas limit for a batch transaction
    pub gas_limit: u64,

    /// Gas price, e.g. `0.025uempe`
    pub gas_price: String,

    /// Memo attached to every batch
    pub memo: String,

    /// Give up on a broadcast after this many seconds, 0 waits for the outcome
    pub broadcast_timeout_secs: u64,

    /// HTTP timeout for relay calls
    pub rpc_timeout_secs: u64,

    /// Address predicate
    pub address_validation: AddressValidation,

    /// Total address length for [`AddressValidation::PrefixLength`]
    pub address_length: usize,

    /// Use the first `X-Forwarded-For` entry as the client key
    pub trust_forwarded_for: bool,

    /// Database path
    pub db_path: String,

    /// Enable CORS
    pub cors_enabled: bool,

    /// Logging
    pub logging: LoggingConfig,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:3000".to_string(),
            rpc_url: "http://localhost:8090/rpc".to_string(),
            chain_id: "empe-testnet-2".to_string(),
            mnemonic: Secret::default(),
            hd_path: "m/44'/118'/0'/0/0".to_string(),
            address_prefix: "empe".to_string(),
            denom: "uempe".to_string(),
            amount: 1_000_000,
            dispatch_interval_secs: 7,
            rate_limit_window_secs: 3600, // 1 hour
            max_requests_per_window: 5,
            rate_limit_reap_interval_secs: 0,
            global_requests_per_minute: 0,
            gas_limit: 200_000,
            gas_price: "0.025uempe".to_string(),
            memo: "Thanks for using Empe Faucet".to_string(),
            broadcast_timeout_secs: 0,
            rpc_timeout_secs: 30,
            address_validation: AddressValidation::Bech32,
            address_length: 43,
            trust_forwarded_for: true,
            db_path: "./faucet_data".to_string(),
            cors_enabled: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl FaucetConfig {
    /// Load from environment variables with defaults
    pub fn from_env() -> FaucetResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a config file, then let `FAUCET_*` variables override it
    pub fn from_file<P: AsRef<Path>>(path: P) -> FaucetResult<Self> {
        let mut config: Self = empe_common::utils::config::load_config(path)
            .map_err(|e| FaucetError::Config(format!("{:#}", e)))?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> FaucetResult<()> {
        if let Some(addr) = env("FAUCET_SERVER_ADDR") {
            self.server_addr = addr;
        }
        if let Some(rpc_url) = env("FAUCET_RPC_URL") {
            self.rpc_url = rpc_url;
        }
        if let Some(chain_id) = env("FAUCET_CHAIN_ID") {
            self.chain_id = chain_id;
        }
        if let Some(mnemonic) = env("FAUCET_MNEMONIC") {
            self.mnemonic = Secret::new(mnemonic);
        }
        if let Some(hd_path) = env("FAUCET_HD_PATH") {
            self.hd_path = hd_path;
        }
        if let Some(prefix) = env("FAUCET_ADDRESS_PREFIX") {
            self.address_prefix = prefix;
        }
        if let Some(denom) = env("FAUCET_DENOM") {
            self.denom = denom;
        }
        if let Some(amount) = env("FAUCET_AMOUNT") {
            self.amount = parse_env("FAUCET_AMOUNT", &amount)?;
        }
        if let Some(interval) = env("FAUCET_DISPATCH_INTERVAL") {
            self.dispatch_interval_secs = parse_env("FAUCET_DISPATCH_INTERVAL", &interval)?;
        }
        if let Some(window) = env("FAUCET_RATE_LIMIT_WINDOW") {
            self.rate_limit_window_secs = parse_env("FAUCET_RATE_LIMIT_WINDOW", &window)?;
        }
        if let Some(max_req) = env("FAUCET_MAX_REQUESTS") {
            self.max_requests_per_window = parse_env("FAUCET_MAX_REQUESTS", &max_req)?;
        }
        if let Some(reap) = env("FAUCET_RATE_LIMIT_REAP_INTERVAL") {
            self.rate_limit_reap_interval_secs =
                parse_env("FAUCET_RATE_LIMIT_REAP_INTERVAL", &reap)?;
        }
        if let Some(rpm) = env("FAUCET_GLOBAL_RPM") {
            self.global_requests_per_minute = parse_env("FAUCET_GLOBAL_RPM", &rpm)?;
        }
        if let Some(gas_limit) = env("FAUCET_GAS_LIMIT") {
            self.gas_limit = parse_env("FAUCET_GAS_LIMIT", &gas_limit)?;
        }
        if let Some(gas_price) = env("FAUCET_GAS_PRICE") {
            self.gas_price = gas_price;
        }
        if let Some(memo) = env("FAUCET_MEMO") {
            self.memo = memo;
        }
        if let Some(timeout) = env("FAUCET_BROADCAST_TIMEOUT") {
            self.broadcast_timeout_secs = parse_env("FAUCET_BROADCAST_TIMEOUT", &timeout)?;
        }
        if let Some(timeout) = env("FAUCET_RPC_TIMEOUT") {
            self.rpc_timeout_secs = parse_env("FAUCET_RPC_TIMEOUT", &timeout)?;
        }
        if let Some(mode) = env("FAUCET_ADDRESS_VALIDATION") {
            self.address_validation = mode.parse()?;
        }
        if let Some(length) = env("FAUCET_ADDRESS_LENGTH") {
            self.address_length = parse_env("FAUCET_ADDRESS_LENGTH", &length)?;
        }
        if let Some(trust) = env("FAUCET_TRUST_FORWARDED_FOR") {
            self.trust_forwarded_for = trust.to_lowercase() == "true";
        }
        if let Some(db_path) = env("FAUCET_DB_PATH") {
            self.db_path = db_path;
        }
        if let Some(enabled) = env("FAUCET_CORS_ENABLED") {
            self.cors_enabled = enabled.to_lowercase() == "true";
        }

        Ok(())
    }

    /// Reject settings the faucet cannot run with
    pub fn validate(&self) -> FaucetResult<()> {
        if self.mnemonic.is_empty() {
            return Err(FaucetError::Config(
                "mnemonic must be set (FAUCET_MNEMONIC or --mnemonic)".into(),
            ));
        }
        if self.amount == 0 {
            return Err(FaucetError::Config("amount must be greater than zero".into()));
        }
        if self.dispatch_interval_secs == 0 {
            return Err(FaucetError::Config(
                "dispatch_interval_secs must be greater than zero".into(),
            ));
        }
        if self.rate_limit_window_secs == 0 {
            return Err(FaucetError::Config(
                "rate_limit_window_secs must be greater than zero".into(),
            ));
        }
        if self.max_requests_per_window == 0 {
            return Err(FaucetError::Config(
                "max_requests_per_window must be greater than zero".into(),
            ));
        }
        if self.denom.is_empty() {
            return Err(FaucetError::Config("denom must not be empty".into()));
        }
        self.gas_price()?;
        Ok(())
    }

    /// Get dispatch interval
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    /// Get rate limit duration
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn rate_limit_reap_interval(&self) -> Option<Duration> {
        (self.rate_limit_reap_interval_secs > 0)
            .then(|| Duration::from_secs(self.rate_limit_reap_interval_secs))
    }

    pub fn broadcast_timeout(&self) -> Option<Duration> {
        (self.broadcast_timeout_secs > 0).then(|| Duration::from_secs(self.broadcast_timeout_secs))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn gas_price(&self) -> FaucetResult<GasPrice> {
        self.gas_price.parse()
    }

    pub fn derivation_params(&self) -> DerivationParams {
        DerivationParams {
            prefix: self.address_prefix.clone(),
            hd_path: self.hd_path.clone(),
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> FaucetResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FaucetError::Config(format!("{} has an invalid value: {}", key, value)))
}
