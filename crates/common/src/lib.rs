//! Shared utilities for the Empe faucet workspace.

pub mod utils;
