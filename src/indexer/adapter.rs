//! An adapter for the `CreatureSummoned` event. This module is responsible
//! for:
//! - Generating the log query for the summoning contract
//! - Decoding Ethereum log topics and data into summon events

use {
    super::{
        chain::{Log, LogQuery},
        planner::Range,
    },
    crate::event::{self, Rarity, SummonEvent},
    anyhow::{Context, Result},
    ethrpc::types::Digest,
    solabi::{
        abi::EventDescriptor,
        ethprim::{Address, U256},
        value::{EventEncoder, Value},
    },
    std::{
        borrow::Cow,
        time::{Duration, UNIX_EPOCH},
    },
};

/// The summoning contract's event declaration.
pub const SIGNATURE: &str = "event CreatureSummoned(address indexed summoner, uint16 indexed \
                             creatureId, uint16 level, uint256 timestamp)";

pub struct Adapter {
    contract: Address,
    topic: Digest,
    encoder: EventEncoder,
}

impl Adapter {
    /// Creates a new adapter for summons of the specified contract.
    pub fn new(contract: Address) -> Result<Self> {
        let signature = EventDescriptor::parse_declaration(SIGNATURE)?;
        let topic = Digest(
            signature
                .selector()
                .context("anonymous events are not supported")?,
        );
        let encoder = EventEncoder::new(&signature)?;

        Ok(Self {
            contract,
            topic,
            encoder,
        })
    }

    /// Returns the log query for summons in the specified block range.
    pub fn query(&self, range: Range) -> LogQuery {
        LogQuery {
            address: self.contract,
            topic: self.topic,
            from: range.from,
            to: range.to,
        }
    }

    /// Decodes a raw log into a summon event.
    pub fn decode(&self, log: &Log) -> Result<SummonEvent> {
        let transaction_hash = log
            .transaction_hash
            .context("log without transaction hash")?;
        anyhow::ensure!(
            log.topics.first() == Some(&self.topic),
            "log is not a CreatureSummoned event"
        );
        anyhow::ensure!(
            log.topics.len() == 3,
            "expected 3 topics but log has {}",
            log.topics.len()
        );

        let fields = self.encoder.decode(&solabi::log::Log {
            topics: {
                let mut converted = solabi::log::Topics::default();
                for topic in &log.topics {
                    converted.push(topic);
                }
                converted
            },
            data: Cow::Borrowed(&log.data),
        })?;
        let [Value::Address(summoner), Value::Uint(creature_id), Value::Uint(level), Value::Uint(timestamp)] =
            fields.as_slice()
        else {
            anyhow::bail!("unexpected CreatureSummoned fields {fields:?}");
        };

        let creature_id = narrow(creature_id.get(), u16::MAX.into()).context("creature id")?;
        let level = narrow(level.get(), u16::MAX.into()).context("level")?;
        anyhow::ensure!(level >= 1, "level must be at least 1");
        let timestamp = narrow(timestamp.get(), event::MAX_TIMESTAMP.into()).context("timestamp")?;
        let timestamp = UNIX_EPOCH
            .checked_add(Duration::from_secs(timestamp as u64))
            .context("timestamp overflows system time")?;
        if !event::is_valid_creature_id(creature_id as u16) {
            tracing::debug!(%creature_id, "creature outside of the rarity tiers");
        }

        Ok(SummonEvent {
            address: format!("0x{}", hex::encode(summoner.0)),
            creature_id: creature_id as u16,
            rarity: Rarity::of(creature_id as u16),
            level: level as u16,
            timestamp,
            block_number: log.block_number,
            transaction_hash: format!("0x{}", hex::encode(transaction_hash.0)),
        })
    }
}

/// Checks that a decoded integer fits into `max` and returns it as `u128`.
fn narrow(value: U256, max: u128) -> Result<u128> {
    anyhow::ensure!(value <= U256::new(max), "{value} out of range");
    Ok(value.as_u128())
}
