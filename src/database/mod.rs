mod postgres;
mod sqlite;

pub use self::{postgres::Postgres, sqlite::Sqlite};
use crate::event::{Cursor, Rarity, SummonEvent};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::time::SystemTime;

/// The outcome of idempotently inserting an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Insert {
    Inserted,
    /// An event with the same transaction hash is already stored.
    AlreadyExists,
}

/// Restricts which events are aggregated by [`Database::aggregate_by_address`].
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// Only aggregate events of this (lowercase) address.
    pub address: Option<String>,
    /// Only count events of this rarity.
    pub rarity: Option<Rarity>,
    /// Maximum number of addresses to return.
    pub limit: Option<u64>,
}

/// Summon counts for a single address.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressStats {
    pub address: String,
    pub total_summons: u64,
    pub deity_count: u64,
    pub epic_count: u64,
    pub rare_count: u64,
    pub common_count: u64,
    pub last_summon_time: SystemTime,
}

/// Summon counts for a single address along with its leaderboard rank.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    #[serde(flatten)]
    pub stats: AddressStats,
    /// 1-based; addresses with identical counts share a rank.
    pub rank: u64,
}

/// Offset based pagination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Page {
    pub limit: u64,
    pub skip: u64,
}

/// A page of an address' summon history, newest first.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub events: Vec<SummonEvent>,
    pub total: u64,
    pub has_more: bool,
}

/// Summon counts over all addresses.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub total_summons: u64,
    pub total_users: u64,
    pub common: u64,
    pub rare: u64,
    pub epic: u64,
    pub deity: u64,
}

/// Persistence for summon events and the indexer cursor.
///
/// All writing methods either succeed in full or error without having applied
/// any changes. This is accomplished by using SQL transactions.
///
/// Events are identified by their transaction hash, which is backed by a
/// uniqueness constraint in the database so that multiple indexers can write
/// to the same database concurrently.
pub trait Database: Send {
    /// Retrieves the indexer cursor, `None` if no block range was processed
    /// yet.
    fn cursor(&mut self) -> BoxFuture<'_, Result<Option<Cursor>>>;

    /// Stores a processed block range in a single transaction:
    /// - `events` are inserted unless an event with the same transaction hash
    ///   already exists; the returned vector has one entry per event.
    /// - the cursor is advanced to `block`. The cursor never moves backwards,
    ///   so this is a no-op for a `block` below the stored one.
    fn update<'a>(
        &'a mut self,
        events: &'a [SummonEvent],
        block: u64,
    ) -> BoxFuture<'a, Result<Vec<Insert>>>;

    /// Aggregates summon counts per address, ordered by leaderboard rank.
    fn aggregate_by_address<'a>(
        &'a mut self,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<AddressStats>>>;

    /// Summon statistics and rank of a single address.
    fn user_stats<'a>(&'a mut self, address: &'a str) -> BoxFuture<'a, Result<Option<UserStats>>>;

    /// The summon history of an address, newest first.
    fn history<'a>(&'a mut self, address: &'a str, page: Page) -> BoxFuture<'a, Result<History>>;

    fn global_stats(&mut self) -> BoxFuture<'_, Result<GlobalStats>>;

    /// The most recent summons over all addresses, newest first.
    fn recent(&mut self, limit: u64) -> BoxFuture<'_, Result<Vec<SummonEvent>>>;

    /// The top addresses ranked by their deity, epic, rare and common counts.
    fn leaderboard(&mut self, limit: u64) -> BoxFuture<'_, Result<Vec<AddressStats>>> {
        Box::pin(async move {
            let filter = Filter {
                limit: Some(limit),
                ..Default::default()
            };
            self.aggregate_by_address(&filter).await
        })
    }
}
