//! LiquidityGuard Library
//!
//! Depeg monitoring and payout attestation for on-chain liquidity
//! pools. Exposes the full module set so binaries and integration
//! tests share one implementation.

pub mod chain;
pub mod claims;
pub mod config;
pub mod detector;
pub mod errors;
pub mod lending;
pub mod oracle;
pub mod payout;
pub mod sampler;
pub mod signing;
pub mod snapshot;
pub mod store;
pub mod webhook;

pub use errors::{GuardError, Result};
