//! Domain types for indexed summons.

use serde::Serialize;
use std::{fmt, ops::RangeInclusive, str::FromStr, time::SystemTime};

/// Creature ID ranges per rarity tier.
pub const COMMON: RangeInclusive<u16> = 0..=999;
pub const RARE: RangeInclusive<u16> = 1000..=1499;
pub const EPIC: RangeInclusive<u16> = 1500..=1599;
pub const DEITY: RangeInclusive<u16> = 1600..=1649;

/// The rarity tier of a summoned creature.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    Common,
    Rare,
    Epic,
    Deity,
}

impl Rarity {
    pub const ALL: [Self; 4] = [Self::Common, Self::Rare, Self::Epic, Self::Deity];

    /// Derives the rarity of a creature from its ID. IDs outside of the rare,
    /// epic and deity ranges are common.
    pub fn of(creature_id: u16) -> Self {
        if DEITY.contains(&creature_id) {
            Self::Deity
        } else if EPIC.contains(&creature_id) {
            Self::Epic
        } else if RARE.contains(&creature_id) {
            Self::Rare
        } else {
            Self::Common
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Rare => "rare",
            Self::Epic => "epic",
            Self::Deity => "deity",
        }
    }

    /// The chance in percent of summoning a creature of this tier.
    pub fn drop_rate(&self) -> f64 {
        match self {
            Self::Common => 70.0,
            Self::Rare => 25.0,
            Self::Epic => 4.5,
            Self::Deity => 0.5,
        }
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rarity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|rarity| rarity.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown rarity {s:?}"))
    }
}

/// Returns `true` if the creature ID belongs to one of the rarity tiers.
pub fn is_valid_creature_id(creature_id: u16) -> bool {
    [COMMON, RARE, EPIC, DEITY]
        .iter()
        .any(|range| range.contains(&creature_id))
}

/// A decoded `CreatureSummoned` event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummonEvent {
    /// Lowercase `0x`-prefixed summoner address.
    pub address: String,
    pub creature_id: u16,
    /// Always `Rarity::of(creature_id)`.
    pub rarity: Rarity,
    pub level: u16,
    pub timestamp: SystemTime,
    pub block_number: u64,
    /// Lowercase `0x`-prefixed transaction hash. Unique across all events.
    pub transaction_hash: String,
}

/// The latest summon timestamp that is indexed, 9999-12-31T23:59:59Z. Both
/// storage backends can represent every timestamp up to it.
pub const MAX_TIMESTAMP: u64 = 253_402_300_799;

/// The indexer's persisted position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cursor {
    /// Inclusive upper bound of the blocks that were fully processed.
    pub last_processed_block: u64,
    pub updated_at: SystemTime,
}
