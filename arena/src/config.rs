use crate::error::{Error, Result};
use crate::utils::parse_optional_address;
use serde::*;
use serde_json::from_str;
use std::path::PathBuf;
use std::time::Duration;
use web3::types::{Address, H256};

/// Overrides `chain.staking` when set.
pub const STAKING_ADDRESS_ENV: &str = "ARENA_STAKING_CONTRACT_ADDRESS";

#[derive(clap::Parser, Debug)]
pub struct Opts {
    /// Config file
    #[clap(short = 'c', long = "config", default_value = "config.json")]
    pub config: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub chain: Chain,
    #[serde(default)]
    pub account: Account,
    #[serde(default)]
    pub sync: SyncOpts,
    #[serde(default)]
    pub http_listen: String,
    #[serde(default)]
    pub redis: String,
    /// Bundled hackathon and project records, JSON.
    #[serde(default)]
    pub catalog: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Chain {
    pub name: String,
    #[serde(rename = "chainId")]
    pub chain_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub explorer: String,
    /// Staking contract address; empty or zero means not deployed.
    #[serde(default)]
    pub staking: String,
    #[serde(rename = "gasLimit", default = "default_gas_limit")]
    pub gas_limit: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Account {
    /// Account the node or wallet signs for.
    #[serde(default)]
    pub address: String,
    /// Local signing key, takes precedence over `address`.
    #[serde(default)]
    pub secret: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SyncOpts {
    #[serde(rename = "pollIntervalMs")]
    pub poll_interval_ms: u64,
    #[serde(rename = "debounceMs")]
    pub debounce_ms: u64,
    #[serde(rename = "receiptIntervalMs")]
    pub receipt_interval_ms: u64,
    #[serde(rename = "receiptRetries")]
    pub receipt_retries: u64,
    #[serde(rename = "requestTimeoutSecs")]
    pub request_timeout_secs: u64,
}

impl Default for SyncOpts {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            debounce_ms: 250,
            receipt_interval_ms: 1000,
            receipt_retries: 120,
            request_timeout_secs: 10,
        }
    }
}

fn default_gas_limit() -> u64 {
    500_000
}

impl SyncOpts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn receipt_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_interval_ms)
    }
}

/// Resolved ledger settings injected into the ledger client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSettings {
    pub address: Option<Address>,
    pub gas_limit: u64,
    pub explorer: String,
}

impl LedgerSettings {
    pub fn is_configured(&self) -> bool {
        self.address.is_some()
    }

    pub fn explorer_tx_url(&self, hash: &H256) -> Option<String> {
        if self.explorer.is_empty() {
            None
        } else {
            Some(format!("{}/tx/{:?}", self.explorer.trim_end_matches('/'), hash))
        }
    }
}

impl Config {
    pub fn parse_from_file(file: &PathBuf) -> Result<Self> {
        use std::fs::read_to_string;
        let confstr = read_to_string(file)?;
        Ok(from_str(&confstr)?)
    }

    pub fn show() {
        let de = Config {
            chain: Chain {
                name: "monad-testnet".to_string(),
                chain_id: "10143".to_string(),
                endpoint: "https://testnet-rpc.monad.xyz".to_string(),
                explorer: "https://testnet.monadexplorer.com".to_string(),
                staking: String::new(),
                gas_limit: default_gas_limit(),
            },
            http_listen: "127.0.0.1:8080".to_string(),
            redis: "redis://127.0.0.1:6379/0".to_string(),
            catalog: "catalog.json".to_string(),
            ..Default::default()
        };
        if let Ok(s) = serde_json::to_string_pretty(&de) {
            println!("{}", s)
        }
    }

    /// Resolve the staking address, honouring the environment override.
    pub fn ledger_settings(&self) -> Result<LedgerSettings> {
        let raw = std::env::var(STAKING_ADDRESS_ENV).unwrap_or_else(|_| self.chain.staking.clone());
        Ok(LedgerSettings {
            address: parse_optional_address(&raw)?,
            gas_limit: self.chain.gas_limit,
            explorer: self.chain.explorer.clone(),
        })
    }

    pub fn account_address(&self) -> Result<Option<Address>> {
        if !self.account.secret.trim().is_empty() {
            let (_, addr) = crate::utils::extract_keypair_from_str(&self.account.secret)?;
            return Ok(Some(addr));
        }
        parse_optional_address(&self.account.address)
    }

    pub fn require_account(&self) -> Result<Address> {
        self.account_address()?
            .ok_or_else(|| Error::Config("no account configured: set account.address or account.secret".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let raw = r#"{
            "chain": {
                "name": "monad-testnet",
                "chainId": "10143",
                "endpoint": "http://localhost:8545",
                "staking": "0x0000000000000000000000000000000000000000"
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.chain.gas_limit, 500_000);
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.sync.debounce(), Duration::from_millis(250));

        let settings = LedgerSettings {
            address: parse_optional_address(&config.chain.staking).unwrap(),
            gas_limit: config.chain.gas_limit,
            explorer: config.chain.explorer.clone(),
        };
        assert!(!settings.is_configured());
        assert_eq!(settings.explorer_tx_url(&H256::zero()), None);
        assert!(config.account_address().unwrap().is_none());
        assert!(config.require_account().is_err());
    }

    #[test]
    fn explorer_link_uses_full_hash() {
        let settings = LedgerSettings {
            address: Some(Address::repeat_byte(0x11)),
            gas_limit: 1,
            explorer: "https://testnet.monadexplorer.com/".to_string(),
        };
        assert!(settings.is_configured());
        let url = settings.explorer_tx_url(&H256::repeat_byte(0xab)).unwrap();
        assert_eq!(url, format!("https://testnet.monadexplorer.com/tx/0x{}", "ab".repeat(32)));
    }
}
