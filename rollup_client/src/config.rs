use std::num::NonZeroUsize;
use std::time::Duration;

use alloy::primitives::Address;
use clap::{Parser, ValueEnum, ValueHint};
use state_proof::ProofConfig;
use url::Url;

use crate::retry::Backoff;

/// Which loops a client runs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceRole {
    /// Validate assertions by others and play the challenges we open.
    Validator,
    /// Defend our own assertions.
    Sequencer,
    Both,
}

impl ServiceRole {
    pub fn validates(self) -> bool {
        matches!(self, ServiceRole::Validator | ServiceRole::Both)
    }
}

/// rollup client config
#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Config {
    /// The L1 node RPC URL.
    #[arg(short = 'u', long, env = "ROLLUP_L1_RPC_URL", value_hint = ValueHint::Url)]
    pub l1_rpc_url: Url,
    /// Address of the rollup contract.
    #[arg(short = 'r', long, env = "ROLLUP_ADDRESS")]
    pub rollup_address: Address,
    /// Hex private key of the staking operator.
    #[arg(long, env = "ROLLUP_OPERATOR_KEY", hide_env_values = true)]
    pub operator_key: String,
    #[arg(long, env = "ROLLUP_ROLE", value_enum, default_value = "validator")]
    pub role: ServiceRole,
    /// Stake on validated assertions and confirm them once their deadline
    /// passes.
    #[arg(long, env = "ROLLUP_ACTIVE", default_value_t = false)]
    pub active: bool,
    /// How often L1 is polled for new heads and logs, in milliseconds.
    #[arg(long, env = "ROLLUP_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,
    /// Backoff of the first RPC retry, in milliseconds.
    #[arg(long, env = "ROLLUP_BACKOFF_MS", default_value_t = 500)]
    pub backoff_ms: u64,
    #[arg(long, env = "ROLLUP_MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub max_backoff_ms: u64,
    #[arg(long, env = "ROLLUP_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,
    /// Blocks the backend may re-execute to regenerate a pruned state.
    #[arg(long, env = "ROLLUP_REEXEC", default_value_t = 128)]
    pub reexec: u64,
    /// Number of assertion timelines kept in memory.
    #[arg(long, env = "ROLLUP_INDEX_CACHE_SIZE", default_value = "16")]
    pub index_cache_size: NonZeroUsize,
    /// L1 block to start reading rollup events from.
    #[arg(long, env = "ROLLUP_FROM_BLOCK", default_value_t = 0)]
    pub from_block: u64,
}

impl Config {
    /// Parses `args`, after loading a local `.env` so its variables can
    /// stand in for flags.
    pub fn load_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        crate::env::load_dotenvy_vars_if_present();
        Self::try_parse_from(args)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn proof_config(&self) -> ProofConfig {
        ProofConfig {
            reexec: self.reexec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 7] = [
        "rollup-client",
        "--l1-rpc-url",
        "http://localhost:8545",
        "--rollup-address",
        "0x00000000000000000000000000000000000000aa",
        "--operator-key",
        "0x01",
    ];

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(REQUIRED).unwrap();
        assert_eq!(config.role, ServiceRole::Validator);
        assert!(!config.active);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.proof_config(), ProofConfig::default());
        assert_eq!(config.index_cache_size.get(), 16);
        assert_eq!(config.rollup_address, Address::with_last_byte(0xaa));
    }

    #[test]
    fn role_and_flags() {
        let config = Config::try_parse_from(
            REQUIRED
                .into_iter()
                .chain(["--role", "both", "--active", "--reexec", "32"]),
        )
        .unwrap();
        assert!(config.role.validates());
        assert!(config.active);
        assert_eq!(config.reexec, 32);
        assert!(!ServiceRole::Sequencer.validates());
    }

    #[test]
    fn load_without_a_dotenv_file() {
        let config = Config::load_from(REQUIRED).unwrap();
        assert_eq!(
            config.backoff(),
            Backoff {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(30),
                max_retries: 5,
            }
        );
    }

    #[test]
    fn zero_cache_size_is_rejected() {
        let result = Config::try_parse_from(REQUIRED.into_iter().chain(["--index-cache-size", "0"]));
        assert!(result.is_err());
    }
}
