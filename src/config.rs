//! Engine configuration loaded from the environment.

use std::collections::HashMap;
use std::env;

use serde::Deserialize;

use crate::domain::{AppError, ConfigError};

/// Per-chain connection settings. `CHAIN_CONFIGS` is a JSON array, e.g.
/// `[{"chainId":137,"name":"Polygon","rpcUrl":"https://polygon-rpc.com","browserUrl":"https://polygonscan.com"}]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub browser_url: Option<String>,
}

impl ChainConfig {
    /// Block explorer link for a transaction hash, when an explorer is known
    pub fn transaction_url(&self, hash: &str) -> Option<String> {
        if hash.is_empty() {
            return None;
        }
        self.browser_url
            .as_deref()
            .map(|base| format!("{}/tx/{}", base.trim_end_matches('/'), hash))
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub redis_url: String,
    pub chains: HashMap<u64, ChainConfig>,
    /// Lark webhook for failure notifications; absent disables delivery
    pub lark_webhook_url: Option<String>,
    /// Deployment environment label used in notification titles
    pub env_label: String,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let database_url = require_var("DATABASE_URL")?;
        let redis_url = require_var("REDIS_URL")?;

        let chains = match env::var("CHAIN_CONFIGS").ok().filter(|v| !v.is_empty()) {
            Some(raw) => {
                let list: Vec<ChainConfig> =
                    serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                        name: "CHAIN_CONFIGS".to_string(),
                        message: e.to_string(),
                    })?;
                list.into_iter().map(|c| (c.chain_id, c)).collect()
            }
            None => HashMap::new(),
        };

        let lark_webhook_url = env::var("LARK_WEBHOOK_URL").ok().filter(|v| !v.is_empty());
        let env_label = env::var("APP_ENV").unwrap_or_else(|_| "local".to_string());

        Ok(Self {
            database_url,
            redis_url,
            chains,
            lark_webhook_url,
            env_label,
        })
    }

    pub fn chain(&self, chain_id: u64) -> Result<&ChainConfig, AppError> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| {
                ConfigError::InvalidValue {
                    name: "CHAIN_CONFIGS".to_string(),
                    message: format!("chain {} is not configured", chain_id),
                }
                .into()
            })
    }
}

fn require_var(name: &str) -> Result<String, AppError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()).into())
}
