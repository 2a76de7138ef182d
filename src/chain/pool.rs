//! Pool reads with ordered ABI-variant fallback.
//!
//! Pools in the wild expose the same economic primitives through
//! incompatible method signatures. Each accessor probes an explicit
//! ordered list of variants and stops at the first that succeeds; a
//! variant failure is a debug-level fallthrough, not an error.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::chain::abi;
use crate::chain::rpc::{BlockRef, RpcClient};
use crate::errors::{GuardError, Result};

/// One probe-able signature variant for a pool capability.
#[derive(Debug, Clone, Copy)]
pub struct CallVariant {
    pub name: &'static str,
    pub signature: &'static str,
}

const BALANCE_VARIANTS: &[CallVariant] = &[
    CallVariant { name: "balances_uint256", signature: "balances(uint256)" },
    CallVariant { name: "balances_int128", signature: "balances(int128)" },
    CallVariant { name: "underlying_balances_uint256", signature: "underlying_balances(uint256)" },
    CallVariant { name: "underlying_balances_int128", signature: "underlying_balances(int128)" },
];

const COIN_VARIANTS: &[CallVariant] = &[
    CallVariant { name: "coins_uint256", signature: "coins(uint256)" },
    CallVariant { name: "coins_int128", signature: "coins(int128)" },
    CallVariant { name: "underlying_coins_uint256", signature: "underlying_coins(uint256)" },
    CallVariant { name: "underlying_coins_int128", signature: "underlying_coins(int128)" },
];

const QUOTE_VARIANTS: &[CallVariant] = &[
    CallVariant { name: "get_dy_int128", signature: "get_dy(int128,int128,uint256)" },
    CallVariant { name: "get_dy_int256", signature: "get_dy(int256,int256,uint256)" },
    CallVariant { name: "get_dy_underlying", signature: "get_dy_underlying(int128,int128,uint256)" },
];

/// Convert a raw token amount to human units.
pub fn format_units(raw: u128, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

/// Convert a human amount to raw token units (truncating).
pub fn parse_units(amount: f64, decimals: u8) -> u128 {
    (amount * 10f64.powi(decimals as i32)) as u128
}

pub struct PoolReader {
    rpc: Arc<RpcClient>,
    pool_address: String,
    fallback_coins: Option<(String, String)>,
    default_decimals: u8,
    cached_coins: RwLock<Option<(String, String)>>,
}

impl PoolReader {
    pub fn new(
        rpc: Arc<RpcClient>,
        pool_address: String,
        fallback_coins: Option<(String, String)>,
        default_decimals: u8,
    ) -> Self {
        Self {
            rpc,
            pool_address,
            fallback_coins,
            default_decimals,
            cached_coins: RwLock::new(None),
        }
    }

    pub fn pool_address(&self) -> &str {
        &self.pool_address
    }

    pub fn rpc_handle(&self) -> Arc<RpcClient> {
        self.rpc.clone()
    }

    /// Probe variants in order against `to`; first decodable result wins.
    async fn try_variants<T>(
        &self,
        to: &str,
        variants: &[CallVariant],
        words: &[abi::Word],
        block: BlockRef,
        decode: impl Fn(&[u8]) -> Option<T>,
    ) -> Option<T> {
        for variant in variants {
            let data = abi::encode_call(variant.signature, words);
            match self.rpc.call(to, &data, block).await {
                Ok(raw) => {
                    if let Some(value) = decode(&raw) {
                        return Some(value);
                    }
                    debug!(variant = variant.name, "undecodable result, trying next variant");
                }
                Err(e) => {
                    debug!(variant = variant.name, error = %e, "call variant failed");
                }
            }
        }
        None
    }

    async fn pool_balance(&self, index: u64, block: BlockRef) -> Option<u128> {
        self.try_variants(
            &self.pool_address,
            BALANCE_VARIANTS,
            &[abi::uint_word(index)],
            block,
            |raw| abi::decode_u128(raw, 0),
        )
        .await
    }

    async fn erc20_balance_of(&self, token: &str, block: BlockRef) -> Option<u128> {
        let holder = abi::address_word(&self.pool_address).ok()?;
        let data = abi::encode_call("balanceOf(address)", &[holder]);
        match self.rpc.call(token, &data, block).await {
            Ok(raw) => abi::decode_u128(&raw, 0),
            Err(e) => {
                debug!(token, error = %e, "balanceOf fallback failed");
                None
            }
        }
    }

    /// Raw (base, quote) reserves at `block`.
    ///
    /// Tries direct pool accessors first, then per-token `balanceOf`
    /// lookups against the resolved coin pair.
    pub async fn balances(&self, block: BlockRef) -> Result<(u128, u128)> {
        let (b0, b1) = tokio::join!(self.pool_balance(0, block), self.pool_balance(1, block));
        if let (Some(base), Some(quote)) = (b0, b1) {
            return Ok((base, quote));
        }

        let (coin0, coin1) = self.coin_addresses().await?;
        let (f0, f1) = tokio::join!(
            self.erc20_balance_of(&coin0, block),
            self.erc20_balance_of(&coin1, block)
        );
        match (f0, f1) {
            (Some(base), Some(quote)) => Ok((base, quote)),
            _ => Err(GuardError::ChainRead(format!(
                "all balance variants exhausted for pool {}",
                self.pool_address
            ))),
        }
    }

    /// Resolve and cache the constituent token addresses.
    pub async fn coin_addresses(&self) -> Result<(String, String)> {
        if let Some(cached) = self.cached_coins.read().clone() {
            return Ok(cached);
        }

        let mut coins = Vec::with_capacity(2);
        for index in 0..2u64 {
            let resolved = self
                .try_variants(
                    &self.pool_address,
                    COIN_VARIANTS,
                    &[abi::uint_word(index)],
                    BlockRef::Latest,
                    |raw| abi::decode_address(raw, 0),
                )
                .await;
            match resolved {
                Some(addr) => coins.push(addr),
                None => break,
            }
        }

        let pair = if coins.len() == 2 {
            (coins[0].clone(), coins[1].clone())
        } else if let Some(fallback) = &self.fallback_coins {
            fallback.clone()
        } else {
            return Err(GuardError::Configuration(format!(
                "unable to resolve coin addresses for pool {} and no fallback pair configured",
                self.pool_address
            )));
        };

        *self.cached_coins.write() = Some(pair.clone());
        Ok(pair)
    }

    /// Best-effort decimals lookup. Failure returns the configured
    /// default; decimals unavailability must never abort a sample.
    pub async fn token_decimals(&self, token: &str) -> u8 {
        let data = abi::encode_call("decimals()", &[]);
        match self.rpc.call(token, &data, BlockRef::Latest).await {
            Ok(raw) => abi::decode_u64(&raw, 0)
                .and_then(|d| u8::try_from(d).ok())
                .unwrap_or(self.default_decimals),
            Err(e) => {
                debug!(token, error = %e, "decimals read failed, using default");
                self.default_decimals
            }
        }
    }

    pub async fn total_supply(&self, block: BlockRef) -> Result<u128> {
        let data = abi::encode_call("totalSupply()", &[]);
        let raw = self
            .rpc
            .call(&self.pool_address, &data, block)
            .await
            .map_err(|e| GuardError::ChainRead(format!("totalSupply: {e}")))?;
        abi::decode_u128(&raw, 0)
            .ok_or_else(|| GuardError::ChainRead("undecodable totalSupply result".to_string()))
    }

    /// Simulated swap quote of `amount_in` raw units from coin `i` to
    /// coin `j`. `None` means no quote variant succeeded; callers must
    /// treat that as "severity unknown this tick", never as fatal.
    pub async fn quote_swap(
        &self,
        i: u64,
        j: u64,
        amount_in: u128,
        block: BlockRef,
    ) -> Option<u128> {
        self.try_variants(
            &self.pool_address,
            QUOTE_VARIANTS,
            &[abi::uint_word(i), abi::uint_word(j), abi::u128_word(amount_in)],
            block,
            |raw| abi::decode_u128(raw, 0),
        )
        .await
    }
}
