use crate::{
    database::{AddressStats, Database, Filter, GlobalStats, History, Insert, Page, UserStats},
    event::{Cursor, SummonEvent},
};
use anyhow::{Context, Result};
use futures::{future::BoxFuture, FutureExt};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction};
use std::{
    env,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use url::Url;

pub struct Sqlite {
    connection: Connection,
}

impl Sqlite {
    pub fn new(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(SCHEMA)
            .context("create summon tables")?;

        connection
            .prepare_cached(GET_CURSOR)
            .context("prepare get_cursor")?;
        connection
            .prepare_cached(UPSERT_CURSOR)
            .context("prepare upsert_cursor")?;
        connection
            .prepare_cached(INSERT_EVENT)
            .context("prepare insert_event")?;

        Ok(Self { connection })
    }

    /// Opens the summon store at a `sqlite://[/path[?query]]` URL:
    ///
    /// - `sqlite://` keeps everything in memory
    /// - `sqlite:///summons.db` is relative to the working directory
    /// - `sqlite:////var/lib/summons.db` is an absolute path
    ///
    /// The query string is passed on as SQLite URI parameters, see
    /// <https://www.sqlite.org/uri.html>.
    pub fn open(url: &Url) -> Result<Self> {
        anyhow::ensure!(url.scheme() == "sqlite", "not an sqlite:// URL");
        anyhow::ensure!(
            url.has_authority() && url.authority() == "",
            "sqlite:// URL requires empty authority"
        );
        anyhow::ensure!(
            url.fragment().is_none(),
            "sqlite:// URL does not support fragments"
        );

        if url.path().is_empty() {
            tracing::debug!("opening in-memory database");
            return Self::new(Connection::open_in_memory()?);
        };

        // SQLite 3 supports connection strings as file:// URLs, convert our
        // `sqlite://` to that.
        let path = env::current_dir()?.join(
            url.path()
                .strip_prefix('/')
                .context("sqlite:// URL path not prefixed with /")?,
        );
        let mut file = Url::from_file_path(path)
            .ok()
            .context("invalid sqlite:// URL file path")?;
        if let Some(query) = url.query() {
            file.set_query(Some(query));
        }

        tracing::debug!("opening database {file}");
        let connection = Connection::open_with_flags(
            file.as_str(),
            OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI,
        )?;

        Self::new(connection)
    }

    #[cfg(test)]
    /// Create a temporary in memory database for tests.
    pub fn new_for_test() -> Self {
        Self::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[cfg(test)]
    /// Access to the connection. Useful for tests.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn get_cursor(&self) -> Result<Option<Cursor>> {
        let mut statement = self
            .connection
            .prepare_cached(GET_CURSOR)
            .context("prepare_cached")?;
        let cursor: Option<(i64, i64)> = statement
            .query_row((), |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .context("query_row")?;
        cursor
            .map(|(block, updated_at)| -> Result<Cursor> {
                Ok(Cursor {
                    last_processed_block: block.try_into().context("block out of bounds")?,
                    updated_at: from_unix(updated_at)?,
                })
            })
            .transpose()
    }

    fn store(&mut self, events: &[SummonEvent], block: u64) -> Result<Vec<Insert>> {
        let transaction = self.connection.transaction().context("transaction")?;
        let inserts = events
            .iter()
            .map(|event| insert_event_if_absent(&transaction, event))
            .collect::<Result<Vec<_>>>()
            .context("insert_event_if_absent")?;
        upsert_cursor(&transaction, block).context("upsert_cursor")?;
        transaction.commit().context("commit")?;
        Ok(inserts)
    }

    fn aggregate(&self, filter: &Filter) -> Result<Vec<AddressStats>> {
        let limit = match filter.limit {
            Some(limit) => i64::try_from(limit).context("limit out of bounds")?,
            None => -1,
        };
        let mut statement = self
            .connection
            .prepare_cached(AGGREGATE_BY_ADDRESS)
            .context("prepare_cached")?;
        let rows = statement
            .query_map(
                (
                    filter.address.as_deref(),
                    filter.rarity.map(|rarity| rarity.as_str()),
                    limit,
                ),
                raw_stats,
            )
            .context("query_map")?;
        let stats = rows
            .map(|row| address_stats(row?))
            .collect::<Result<Vec<_>>>()?;
        Ok(stats)
    }

    fn get_user_stats(&self, address: &str) -> Result<Option<UserStats>> {
        let mut statement = self
            .connection
            .prepare_cached(USER_STATS)
            .context("prepare_cached")?;
        let row = statement
            .query_row((address,), |row| Ok((raw_stats(row)?, row.get::<_, i64>(7)?)))
            .optional()
            .context("query_row")?;
        row.map(|(stats, rank)| -> Result<UserStats> {
            Ok(UserStats {
                stats: address_stats(stats)?,
                rank: rank.try_into().context("rank out of bounds")?,
            })
        })
        .transpose()
    }

    fn get_history(&self, address: &str, page: Page) -> Result<History> {
        let limit = i64::try_from(page.limit).context("limit out of bounds")?;
        let skip = i64::try_from(page.skip).context("skip out of bounds")?;

        let mut statement = self
            .connection
            .prepare_cached(HISTORY)
            .context("prepare_cached")?;
        let events = statement
            .query_map((address, limit, skip), raw_event)
            .context("query_map")?
            .map(|row| summon_event(row?))
            .collect::<Result<Vec<_>>>()?;

        let total: i64 = self
            .connection
            .prepare_cached(COUNT_HISTORY)
            .context("prepare_cached")?
            .query_row((address,), |row| row.get(0))
            .context("query_row")?;
        let total = u64::try_from(total).context("total out of bounds")?;

        Ok(History {
            events,
            total,
            has_more: page.skip.saturating_add(page.limit) < total,
        })
    }

    fn get_global_stats(&self) -> Result<GlobalStats> {
        let counts: [i64; 6] = self
            .connection
            .prepare_cached(GLOBAL_STATS)
            .context("prepare_cached")?
            .query_row((), |row| {
                Ok([
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ])
            })
            .context("query_row")?;
        let count = |value: i64| u64::try_from(value).context("count out of bounds");
        Ok(GlobalStats {
            total_summons: count(counts[0])?,
            total_users: count(counts[1])?,
            common: count(counts[2])?,
            rare: count(counts[3])?,
            epic: count(counts[4])?,
            deity: count(counts[5])?,
        })
    }

    fn get_recent(&self, limit: u64) -> Result<Vec<SummonEvent>> {
        let limit = i64::try_from(limit).context("limit out of bounds")?;
        let mut statement = self
            .connection
            .prepare_cached(RECENT)
            .context("prepare_cached")?;
        let rows = statement
            .query_map((limit,), raw_event)
            .context("query_map")?;
        let events = rows
            .map(|row| summon_event(row?))
            .collect::<Result<Vec<_>>>()?;
        Ok(events)
    }
}

impl Database for Sqlite {
    fn cursor(&mut self) -> BoxFuture<'_, Result<Option<Cursor>>> {
        async move { self.get_cursor() }.boxed()
    }

    fn update<'a>(
        &'a mut self,
        events: &'a [SummonEvent],
        block: u64,
    ) -> BoxFuture<'a, Result<Vec<Insert>>> {
        async move { self.store(events, block) }.boxed()
    }

    fn aggregate_by_address<'a>(
        &'a mut self,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<AddressStats>>> {
        async move { self.aggregate(filter) }.boxed()
    }

    fn user_stats<'a>(&'a mut self, address: &'a str) -> BoxFuture<'a, Result<Option<UserStats>>> {
        async move { self.get_user_stats(address) }.boxed()
    }

    fn history<'a>(&'a mut self, address: &'a str, page: Page) -> BoxFuture<'a, Result<History>> {
        async move { self.get_history(address, page) }.boxed()
    }

    fn global_stats(&mut self) -> BoxFuture<'_, Result<GlobalStats>> {
        async move { self.get_global_stats() }.boxed()
    }

    fn recent(&mut self, limit: u64) -> BoxFuture<'_, Result<Vec<SummonEvent>>> {
        async move { self.get_recent(limit) }.boxed()
    }
}

fn insert_event_if_absent(con: &Transaction, event: &SummonEvent) -> Result<Insert> {
    let mut statement = con
        .prepare_cached(INSERT_EVENT)
        .context("prepare_cached")?;
    let rows = statement
        .execute((
            &event.transaction_hash,
            &event.address,
            event.creature_id,
            event.rarity.as_str(),
            event.level,
            to_unix(event.timestamp)?,
            i64::try_from(event.block_number).context("block out of bounds")?,
        ))
        .context("execute")?;
    Ok(match rows {
        0 => Insert::AlreadyExists,
        _ => Insert::Inserted,
    })
}

fn upsert_cursor(con: &Transaction, block: u64) -> Result<()> {
    let block = i64::try_from(block).context("block out of bounds")?;
    let mut statement = con
        .prepare_cached(UPSERT_CURSOR)
        .context("prepare_cached")?;
    let rows = statement
        .execute((block, to_unix(SystemTime::now())?))
        .context("execute")?;
    anyhow::ensure!(rows == 1, "query unexpectedly changed {rows} rows instead of 1");
    Ok(())
}

type RawStats = (String, i64, i64, i64, i64, i64, i64);

fn raw_stats(row: &rusqlite::Row) -> rusqlite::Result<RawStats> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn address_stats(
    (address, total, deity, epic, rare, common, last): RawStats,
) -> Result<AddressStats> {
    let count = |value: i64| u64::try_from(value).context("count out of bounds");
    Ok(AddressStats {
        address,
        total_summons: count(total)?,
        deity_count: count(deity)?,
        epic_count: count(epic)?,
        rare_count: count(rare)?,
        common_count: count(common)?,
        last_summon_time: from_unix(last)?,
    })
}

type RawEvent = (String, i64, String, i64, i64, i64, String);

fn raw_event(row: &rusqlite::Row) -> rusqlite::Result<RawEvent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn summon_event(
    (address, creature_id, rarity, level, timestamp, block_number, transaction_hash): RawEvent,
) -> Result<SummonEvent> {
    Ok(SummonEvent {
        address,
        creature_id: creature_id.try_into().context("creature id out of bounds")?,
        rarity: rarity.parse()?,
        level: level.try_into().context("level out of bounds")?,
        timestamp: from_unix(timestamp)?,
        block_number: block_number.try_into().context("block out of bounds")?,
        transaction_hash,
    })
}

fn to_unix(time: SystemTime) -> Result<i64> {
    let seconds = time
        .duration_since(UNIX_EPOCH)
        .context("time before unix epoch")?
        .as_secs();
    seconds.try_into().context("timestamp out of bounds")
}

fn from_unix(seconds: i64) -> Result<SystemTime> {
    let seconds = u64::try_from(seconds).context("negative timestamp")?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS summon_events (
    transaction_hash TEXT PRIMARY KEY NOT NULL,
    address TEXT NOT NULL,
    creature_id INTEGER NOT NULL,
    rarity TEXT NOT NULL CHECK (rarity IN ('common', 'rare', 'epic', 'deity')),
    level INTEGER NOT NULL CHECK (level >= 1),
    timestamp INTEGER NOT NULL,
    block_number INTEGER NOT NULL
) STRICT;
CREATE INDEX IF NOT EXISTS summon_events_address_timestamp ON summon_events (address, timestamp DESC);
CREATE INDEX IF NOT EXISTS summon_events_rarity_timestamp ON summon_events (rarity, timestamp DESC);
CREATE INDEX IF NOT EXISTS summon_events_address_rarity ON summon_events (address, rarity);
CREATE TABLE IF NOT EXISTS _indexer_cursor (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 0),
    last_processed_block INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) STRICT;
";

const GET_CURSOR: &str =
    "SELECT last_processed_block, updated_at FROM _indexer_cursor WHERE id = 0;";
const UPSERT_CURSOR: &str = "INSERT INTO _indexer_cursor (id, last_processed_block, updated_at) \
     VALUES (0, ?1, ?2) ON CONFLICT(id) DO UPDATE SET \
     last_processed_block = MAX(last_processed_block, excluded.last_processed_block), \
     updated_at = excluded.updated_at;";
const INSERT_EVENT: &str = "INSERT INTO summon_events \
     (transaction_hash, address, creature_id, rarity, level, timestamp, block_number) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) ON CONFLICT(transaction_hash) DO NOTHING;";

/// Parameters:
/// - 1: optional address
/// - 2: optional rarity
/// - 3: limit, negative for unlimited
const AGGREGATE_BY_ADDRESS: &str = "
SELECT address,
    COUNT(*) AS total_summons,
    SUM(CASE WHEN rarity = 'deity' THEN 1 ELSE 0 END) AS deity_count,
    SUM(CASE WHEN rarity = 'epic' THEN 1 ELSE 0 END) AS epic_count,
    SUM(CASE WHEN rarity = 'rare' THEN 1 ELSE 0 END) AS rare_count,
    SUM(CASE WHEN rarity = 'common' THEN 1 ELSE 0 END) AS common_count,
    MAX(timestamp) AS last_summon_time
FROM summon_events
WHERE (?1 IS NULL OR address = ?1) AND (?2 IS NULL OR rarity = ?2)
GROUP BY address
ORDER BY deity_count DESC, epic_count DESC, rare_count DESC, common_count DESC, address ASC
LIMIT ?3;
";
const USER_STATS: &str = "
WITH stats AS (
    SELECT address,
        COUNT(*) AS total_summons,
        SUM(CASE WHEN rarity = 'deity' THEN 1 ELSE 0 END) AS deity_count,
        SUM(CASE WHEN rarity = 'epic' THEN 1 ELSE 0 END) AS epic_count,
        SUM(CASE WHEN rarity = 'rare' THEN 1 ELSE 0 END) AS rare_count,
        SUM(CASE WHEN rarity = 'common' THEN 1 ELSE 0 END) AS common_count,
        MAX(timestamp) AS last_summon_time
    FROM summon_events
    GROUP BY address
)
SELECT s.address, s.total_summons, s.deity_count, s.epic_count, s.rare_count, s.common_count,
    s.last_summon_time,
    (SELECT COUNT(*) FROM stats o WHERE
        o.deity_count > s.deity_count
        OR (o.deity_count = s.deity_count AND o.epic_count > s.epic_count)
        OR (o.deity_count = s.deity_count AND o.epic_count = s.epic_count
            AND o.rare_count > s.rare_count)
        OR (o.deity_count = s.deity_count AND o.epic_count = s.epic_count
            AND o.rare_count = s.rare_count AND o.common_count > s.common_count)
    ) + 1 AS rank
FROM stats s
WHERE s.address = ?1;
";
const HISTORY: &str = "
SELECT address, creature_id, rarity, level, timestamp, block_number, transaction_hash
FROM summon_events
WHERE address = ?1
ORDER BY timestamp DESC, block_number DESC, transaction_hash DESC
LIMIT ?2 OFFSET ?3;
";
const COUNT_HISTORY: &str = "SELECT COUNT(*) FROM summon_events WHERE address = ?1;";
const GLOBAL_STATS: &str = "
SELECT COUNT(*),
    COUNT(DISTINCT address),
    COALESCE(SUM(CASE WHEN rarity = 'common' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN rarity = 'rare' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN rarity = 'epic' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN rarity = 'deity' THEN 1 ELSE 0 END), 0)
FROM summon_events;
";
const RECENT: &str = "
SELECT address, creature_id, rarity, level, timestamp, block_number, transaction_hash
FROM summon_events
ORDER BY timestamp DESC, block_number DESC, transaction_hash DESC
LIMIT ?1;
";
