//! Per-chain gas price cache and the escalation rule for replacements.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{AppError, ChainClient, KeyValueStore};

use super::keys::{GAS_PRICE_TTL, gas_price_key};

/// Hard ceiling on any gas price the engine will offer, in wei (50 gwei)
pub const MAX_GAS_PRICE: u64 = 50 * 10u64.pow(9);

/// Default escalation rate when replacing a stalled transaction
pub const ESCALATION_RATE: f64 = 0.2;

/// Short-TTL cache over `eth_gasPrice`, shared across processes
#[derive(Clone)]
pub struct GasPriceCache {
    store: Arc<dyn KeyValueStore>,
}

impl GasPriceCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Cached price if fresh, else query the chain and cache for ~3s
    pub async fn get(&self, chain: &dyn ChainClient) -> Result<u64, AppError> {
        let key = gas_price_key(chain.chain_id());
        if let Some(cached) = self.store.get(&key).await? {
            if let Ok(price) = cached.parse::<u64>() {
                return Ok(price);
            }
            // Unparseable entry: fall through and overwrite
        }
        let price = chain.get_gas_price().await?;
        self.store
            .set_ex(&key, &price.to_string(), GAS_PRICE_TTL)
            .await?;
        debug!(chain_id = chain.chain_id(), price, "cached network gas price");
        Ok(price)
    }

    /// Raise a stalled transaction's price for replacement. Used only when
    /// replacing a pending send, never for a fresh submission.
    pub fn escalate(&self, gas_price: u64) -> u64 {
        escalate_with_rate(gas_price, ESCALATION_RATE)
    }
}

/// Multiply by `(1 + rate)`, floor to an integer, cap at `MAX_GAS_PRICE`
pub fn escalate_with_rate(gas_price: u64, rate: f64) -> u64 {
    let raised = (gas_price as f64 * (1.0 + rate)).floor() as u64;
    raised.min(MAX_GAS_PRICE)
}
