use crate::indexer::{Planner, Run, Strategy};
use clap::Parser;
use solabi::ethprim::Address;
use std::{
    fmt::{self, Debug, Formatter},
    num::NonZeroU64,
    time::Duration,
};
use url::Url;

/// Indexes `CreatureSummoned` events of a contract into a database.
#[derive(Parser)]
#[clap(version)]
pub struct Config {
    /// The summoning contract.
    #[clap(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Address,

    /// Network name, only used for logging.
    #[clap(long, env = "NETWORK", value_parser = parse::non_empty)]
    pub network: String,

    /// The chain ID the node is expected to serve.
    #[clap(long, env = "CHAIN_ID", value_parser = clap::value_parser!(u64).range(1..))]
    pub chain_id: u64,

    /// Ethereum JSON-RPC node URL.
    #[clap(long, env = "RPC_URL")]
    pub rpc_url: Url,

    /// The first block to index.
    #[clap(long, env = "START_BLOCK")]
    pub start_block: u64,

    /// The delay between polls for new blocks, in milliseconds.
    #[clap(long, env = "POLL_INTERVAL", value_parser = parse::millis)]
    pub poll_interval: Duration,

    /// Maximum number of blocks indexed per poll.
    #[clap(long, env = "MAX_BLOCKS_PER_POLL")]
    pub max_blocks_per_poll: NonZeroU64,

    /// Only index this many blocks below the head, skipping older ones.
    /// Unset to catch up on the full history.
    #[clap(long, env = "SAFE_BLOCK_RANGE")]
    pub safe_block_range: Option<u64>,

    /// `sqlite://` or `postgres://` database URL.
    #[clap(long, env = "DATABASE_URL", value_parser = parse::database_url)]
    pub database_url: Url,

    /// Delay growth after failures: `fixed` or `exponential`.
    #[clap(long, env = "RETRY_STRATEGY", default_value = "fixed")]
    pub retry_strategy: Strategy,

    /// Upper bound for exponential retry delays, in milliseconds.
    #[clap(
        long,
        env = "MAX_RETRY_DELAY",
        default_value = "60000",
        value_parser = parse::millis
    )]
    pub max_retry_delay: Duration,
}

impl Config {
    /// The indexer run configuration.
    pub fn run(&self) -> Run {
        Run {
            chain_id: self.chain_id,
            planner: Planner {
                start_block: self.start_block,
                chunk_size: self.max_blocks_per_poll,
                safe_block_range: self.safe_block_range,
            },
            poll_interval: self.poll_interval,
            retry: self.retry_strategy,
            max_retry_delay: self.max_retry_delay,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("contract_address", &self.contract_address)
            .field("network", &self.network)
            .field("chain_id", &self.chain_id)
            .field("rpc_url", &redact(&self.rpc_url))
            .field("start_block", &self.start_block)
            .field("poll_interval", &self.poll_interval)
            .field("max_blocks_per_poll", &self.max_blocks_per_poll)
            .field("safe_block_range", &self.safe_block_range)
            .field("database_url", &redact(&self.database_url))
            .field("retry_strategy", &self.retry_strategy)
            .field("max_retry_delay", &self.max_retry_delay)
            .finish()
    }
}

/// Hides credentials: URL passwords and query strings, which commonly carry
/// API keys.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    if url.query().is_some() {
        url.set_query(Some("***"));
    }
    url.to_string()
}

mod parse {
    use anyhow::Result;
    use std::time::Duration;
    use url::Url;

    pub fn non_empty(s: &str) -> Result<String> {
        let s = s.trim();
        anyhow::ensure!(!s.is_empty(), "must not be empty");
        Ok(s.to_owned())
    }

    pub fn millis(s: &str) -> Result<Duration> {
        let millis = s.parse::<u64>()?;
        anyhow::ensure!(millis >= 1, "must be at least 1ms");
        Ok(Duration::from_millis(millis))
    }

    pub fn database_url(s: &str) -> Result<Url> {
        let url = Url::parse(s)?;
        anyhow::ensure!(
            matches!(url.scheme(), "sqlite" | "postgres" | "postgresql"),
            "unsupported database {:?}, expected sqlite:// or postgres://",
            url.scheme()
        );
        Ok(url)
    }
}
