use {
    crate::{
        database::{AddressStats, Database, Filter, GlobalStats, History, Insert, Page, UserStats},
        event::{Cursor, SummonEvent},
    },
    anyhow::{Context, Result},
    futures::{future::BoxFuture, FutureExt},
    pg_bigdecimal::{BigDecimal, PgNumeric},
    std::time::SystemTime,
    tokio_postgres::{Row, Transaction},
};

pub struct Postgres {
    client: tokio_postgres::Client,
}

impl Postgres {
    pub async fn connect(params: &str) -> Result<Self> {
        tracing::debug!("opening postgres database");
        let (client, connection) = tokio_postgres::connect(params, tokio_postgres::NoTls)
            .await
            .context("connect client")?;

        // The connection object performs the actual communication with the database,
        // so spawn it off to run on its own.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(?err, "postgres connection error");
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .context("create summon tables")?;

        for statement in [GET_CURSOR, UPSERT_CURSOR, INSERT_EVENT] {
            client
                .prepare(statement)
                .await
                .with_context(|| format!("prepare {statement}"))?;
        }

        Ok(Self { client })
    }

    async fn get_cursor(&self) -> Result<Option<Cursor>> {
        let row = self
            .client
            .query_opt(GET_CURSOR, &[])
            .await
            .context("query GET_CURSOR")?;
        row.map(|row| -> Result<Cursor> {
            Ok(Cursor {
                last_processed_block: block_number(row.try_get(0)?)?,
                updated_at: row.try_get(1)?,
            })
        })
        .transpose()
    }

    async fn store(&mut self, events: &[SummonEvent], block: u64) -> Result<Vec<Insert>> {
        let transaction = self.client.transaction().await.context("transaction")?;

        let mut inserts = Vec::with_capacity(events.len());
        for event in events {
            inserts.push(
                Self::insert_event_if_absent(&transaction, event)
                    .await
                    .context("insert_event_if_absent")?,
            );
        }
        Self::upsert_cursor(&transaction, block)
            .await
            .context("upsert_cursor")?;

        transaction.commit().await.context("commit")?;
        Ok(inserts)
    }

    async fn insert_event_if_absent(
        transaction: &Transaction<'_>,
        event: &SummonEvent,
    ) -> Result<Insert> {
        let statement = transaction
            .prepare(INSERT_EVENT)
            .await
            .context("prepare INSERT_EVENT")?;
        let rows = transaction
            .execute(
                &statement,
                &[
                    &event.transaction_hash,
                    &event.address,
                    &i32::from(event.creature_id),
                    &event.rarity.as_str(),
                    &i32::from(event.level),
                    &event.timestamp,
                    &numeric(event.block_number),
                ],
            )
            .await
            .context("execute INSERT_EVENT")?;
        Ok(match rows {
            0 => Insert::AlreadyExists,
            _ => Insert::Inserted,
        })
    }

    async fn upsert_cursor(transaction: &Transaction<'_>, block: u64) -> Result<()> {
        let statement = transaction
            .prepare(UPSERT_CURSOR)
            .await
            .context("prepare UPSERT_CURSOR")?;
        let rows = transaction
            .execute(&statement, &[&numeric(block), &SystemTime::now()])
            .await
            .context("execute UPSERT_CURSOR")?;
        anyhow::ensure!(rows == 1, "query unexpectedly changed {rows} rows instead of 1");
        Ok(())
    }

    async fn aggregate(&self, filter: &Filter) -> Result<Vec<AddressStats>> {
        let limit = filter
            .limit
            .map(i64::try_from)
            .transpose()
            .context("limit out of bounds")?;
        let rows = self
            .client
            .query(
                AGGREGATE_BY_ADDRESS,
                &[
                    &filter.address.as_deref(),
                    &filter.rarity.map(|rarity| rarity.as_str()),
                    &limit,
                ],
            )
            .await
            .context("query AGGREGATE_BY_ADDRESS")?;
        rows.iter().map(address_stats).collect()
    }

    async fn get_user_stats(&self, address: &str) -> Result<Option<UserStats>> {
        let row = self
            .client
            .query_opt(USER_STATS, &[&address])
            .await
            .context("query USER_STATS")?;
        row.map(|row| -> Result<UserStats> {
            Ok(UserStats {
                stats: address_stats(&row)?,
                rank: count(row.try_get(7)?)?,
            })
        })
        .transpose()
    }

    async fn get_history(&self, address: &str, page: Page) -> Result<History> {
        let limit = i64::try_from(page.limit).context("limit out of bounds")?;
        let skip = i64::try_from(page.skip).context("skip out of bounds")?;
        let (rows, total) = tokio::try_join!(
            async {
                self.client
                    .query(HISTORY, &[&address, &limit, &skip])
                    .await
                    .context("query HISTORY")
            },
            async {
                self.client
                    .query_one(COUNT_HISTORY, &[&address])
                    .await
                    .context("query COUNT_HISTORY")
            },
        )?;
        let total = count(total.try_get(0)?)?;
        Ok(History {
            events: rows.iter().map(summon_event).collect::<Result<_>>()?,
            total,
            has_more: page.skip.saturating_add(page.limit) < total,
        })
    }

    async fn get_global_stats(&self) -> Result<GlobalStats> {
        let row = self
            .client
            .query_one(GLOBAL_STATS, &[])
            .await
            .context("query GLOBAL_STATS")?;
        Ok(GlobalStats {
            total_summons: count(row.try_get(0)?)?,
            total_users: count(row.try_get(1)?)?,
            common: count(row.try_get(2)?)?,
            rare: count(row.try_get(3)?)?,
            epic: count(row.try_get(4)?)?,
            deity: count(row.try_get(5)?)?,
        })
    }

    async fn get_recent(&self, limit: u64) -> Result<Vec<SummonEvent>> {
        let limit = i64::try_from(limit).context("limit out of bounds")?;
        let rows = self
            .client
            .query(RECENT, &[&limit])
            .await
            .context("query RECENT")?;
        rows.iter().map(summon_event).collect()
    }
}

impl Database for Postgres {
    fn cursor(&mut self) -> BoxFuture<'_, Result<Option<Cursor>>> {
        self.get_cursor().boxed()
    }

    fn update<'a>(
        &'a mut self,
        events: &'a [SummonEvent],
        block: u64,
    ) -> BoxFuture<'a, Result<Vec<Insert>>> {
        self.store(events, block).boxed()
    }

    fn aggregate_by_address<'a>(
        &'a mut self,
        filter: &'a Filter,
    ) -> BoxFuture<'a, Result<Vec<AddressStats>>> {
        self.aggregate(filter).boxed()
    }

    fn user_stats<'a>(&'a mut self, address: &'a str) -> BoxFuture<'a, Result<Option<UserStats>>> {
        self.get_user_stats(address).boxed()
    }

    fn history<'a>(&'a mut self, address: &'a str, page: Page) -> BoxFuture<'a, Result<History>> {
        self.get_history(address, page).boxed()
    }

    fn global_stats(&mut self) -> BoxFuture<'_, Result<GlobalStats>> {
        self.get_global_stats().boxed()
    }

    fn recent(&mut self, limit: u64) -> BoxFuture<'_, Result<Vec<SummonEvent>>> {
        self.get_recent(limit).boxed()
    }
}

fn numeric(value: u64) -> PgNumeric {
    PgNumeric {
        n: Some(BigDecimal::from(value)),
    }
}

fn block_number(value: PgNumeric) -> Result<u64> {
    value
        .n
        .context("block number is NaN")?
        .to_string()
        .parse()
        .context("block out of bounds")
}

fn count(value: i64) -> Result<u64> {
    u64::try_from(value).context("count out of bounds")
}

fn address_stats(row: &Row) -> Result<AddressStats> {
    Ok(AddressStats {
        address: row.try_get(0)?,
        total_summons: count(row.try_get(1)?)?,
        deity_count: count(row.try_get(2)?)?,
        epic_count: count(row.try_get(3)?)?,
        rare_count: count(row.try_get(4)?)?,
        common_count: count(row.try_get(5)?)?,
        last_summon_time: row.try_get(6)?,
    })
}

fn summon_event(row: &Row) -> Result<SummonEvent> {
    Ok(SummonEvent {
        address: row.try_get(0)?,
        creature_id: row
            .try_get::<_, i32>(1)?
            .try_into()
            .context("creature id out of bounds")?,
        rarity: row.try_get::<_, &str>(2)?.parse()?,
        level: row
            .try_get::<_, i32>(3)?
            .try_into()
            .context("level out of bounds")?,
        timestamp: row.try_get(4)?,
        block_number: block_number(row.try_get(5)?)?,
        transaction_hash: row.try_get(6)?,
    })
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS summon_events (
    transaction_hash TEXT PRIMARY KEY NOT NULL,
    address TEXT NOT NULL,
    creature_id INTEGER NOT NULL,
    rarity TEXT NOT NULL CHECK (rarity IN ('common', 'rare', 'epic', 'deity')),
    level INTEGER NOT NULL CHECK (level >= 1),
    timestamp TIMESTAMPTZ NOT NULL,
    block_number NUMERIC(78, 0) NOT NULL
);
CREATE INDEX IF NOT EXISTS summon_events_address_timestamp ON summon_events (address, timestamp DESC);
CREATE INDEX IF NOT EXISTS summon_events_rarity_timestamp ON summon_events (rarity, timestamp DESC);
CREATE INDEX IF NOT EXISTS summon_events_address_rarity ON summon_events (address, rarity);
CREATE TABLE IF NOT EXISTS _indexer_cursor (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 0),
    last_processed_block NUMERIC(78, 0) NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
";

const GET_CURSOR: &str =
    "SELECT last_processed_block, updated_at FROM _indexer_cursor WHERE id = 0;";
const UPSERT_CURSOR: &str = "INSERT INTO _indexer_cursor (id, last_processed_block, updated_at) \
     VALUES (0, $1, $2) ON CONFLICT (id) DO UPDATE SET \
     last_processed_block = GREATEST(_indexer_cursor.last_processed_block, \
     EXCLUDED.last_processed_block), updated_at = EXCLUDED.updated_at;";
const INSERT_EVENT: &str = "INSERT INTO summon_events \
     (transaction_hash, address, creature_id, rarity, level, timestamp, block_number) \
     VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (transaction_hash) DO NOTHING;";

/// Parameters:
/// - 1: optional address
/// - 2: optional rarity
/// - 3: optional limit
const AGGREGATE_BY_ADDRESS: &str = "
SELECT address,
    COUNT(*) AS total_summons,
    SUM(CASE WHEN rarity = 'deity' THEN 1 ELSE 0 END) AS deity_count,
    SUM(CASE WHEN rarity = 'epic' THEN 1 ELSE 0 END) AS epic_count,
    SUM(CASE WHEN rarity = 'rare' THEN 1 ELSE 0 END) AS rare_count,
    SUM(CASE WHEN rarity = 'common' THEN 1 ELSE 0 END) AS common_count,
    MAX(timestamp) AS last_summon_time
FROM summon_events
WHERE ($1::TEXT IS NULL OR address = $1) AND ($2::TEXT IS NULL OR rarity = $2)
GROUP BY address
ORDER BY deity_count DESC, epic_count DESC, rare_count DESC, common_count DESC, address ASC
LIMIT $3;
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
WHERE s.address = $1;
";
const HISTORY: &str = "
SELECT address, creature_id, rarity, level, timestamp, block_number, transaction_hash
FROM summon_events
WHERE address = $1
ORDER BY timestamp DESC, block_number DESC, transaction_hash DESC
LIMIT $2 OFFSET $3;
";
const COUNT_HISTORY: &str = "SELECT COUNT(*) FROM summon_events WHERE address = $1;";
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
LIMIT $1;
";

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::event::Rarity,
        std::time::{Duration, UNIX_EPOCH},
    };

    async fn local() -> Postgres {
        let postgres = Postgres::connect(&format!("postgresql://{}@localhost", whoami::username()))
            .await
            .unwrap();
        postgres
            .client
            .batch_execute("TRUNCATE summon_events, _indexer_cursor;")
            .await
            .unwrap();
        postgres
    }

    fn event(tx: u8, creature_id: u16) -> SummonEvent {
        SummonEvent {
            address: format!("0x{}", hex::encode([1_u8; 20])),
            creature_id,
            rarity: Rarity::of(creature_id),
            level: 2,
            timestamp: UNIX_EPOCH + Duration::from_secs(1_700_000_000 + u64::from(tx)),
            block_number: u64::MAX - 10 + u64::from(tx),
            transaction_hash: format!("0x{}", hex::encode([tx; 32])),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn update_and_query() {
        let mut postgres = local().await;
        assert_eq!(postgres.cursor().await.unwrap(), None);

        let events = [event(1, 5), event(2, 1620)];
        let inserts = postgres.update(&events, u64::MAX - 5).await.unwrap();
        assert_eq!(inserts, [Insert::Inserted, Insert::Inserted]);
        let inserts = postgres.update(&events, u64::MAX - 5).await.unwrap();
        assert_eq!(inserts, [Insert::AlreadyExists, Insert::AlreadyExists]);

        postgres.update(&[], 7).await.unwrap();
        assert_eq!(
            postgres.cursor().await.unwrap().unwrap().last_processed_block,
            u64::MAX - 5
        );

        assert_eq!(
            postgres.recent(10).await.unwrap(),
            [events[1].clone(), events[0].clone()]
        );
        let user = postgres
            .user_stats(&format!("0x{}", hex::encode([1_u8; 20])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.rank, 1);
        assert_eq!(user.stats.deity_count, 1);
        assert_eq!(user.stats.common_count, 1);
        assert_eq!(postgres.global_stats().await.unwrap().total_users, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn update_is_atomic() {
        let mut postgres = local().await;
        let mut invalid = event(2, 5);
        invalid.level = 0;

        assert!(postgres.update(&[event(1, 5), invalid], 10).await.is_err());
        assert_eq!(postgres.cursor().await.unwrap(), None);
        assert!(postgres.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn stores_latest_timestamp() {
        let mut postgres = local().await;
        let latest = SummonEvent {
            timestamp: UNIX_EPOCH + Duration::from_secs(crate::event::MAX_TIMESTAMP),
            ..event(1, 5)
        };

        postgres.update(&[latest.clone()], 10).await.unwrap();
        assert_eq!(postgres.recent(1).await.unwrap(), [latest]);
    }
}
