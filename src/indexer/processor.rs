//! Indexes a single block range.

use {
    super::{adapter::Adapter, chain::Chain, planner::Range},
    crate::database::{Database, Insert},
    anyhow::{Context, Result},
};

/// Counts of what happened while processing a range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Processed {
    pub logs: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Logs that could not be decoded.
    pub skipped: usize,
}

/// Fetches, decodes and stores all summons in `range`, advancing the cursor to
/// its end. Either all of it is stored or none of it.
pub async fn process<C, D>(
    chain: &C,
    database: &mut D,
    adapter: &Adapter,
    range: Range,
) -> Result<Processed>
where
    C: Chain + ?Sized,
    D: Database + ?Sized,
{
    let logs = chain
        .logs(adapter.query(range))
        .await
        .context("failed to fetch logs")?;

    let mut processed = Processed {
        logs: logs.len(),
        ..Default::default()
    };
    let events = logs
        .iter()
        .filter_map(|log| match adapter.decode(log) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!(?err, ?log, "skipping malformed log");
                processed.skipped += 1;
                None
            }
        })
        .collect::<Vec<_>>();

    let results = database
        .update(&events, range.to)
        .await
        .context("failed to store events")?;
    for (event, result) in events.iter().zip(results) {
        match result {
            Insert::Inserted => {
                tracing::debug!(
                    tx = %event.transaction_hash, address = %event.address,
                    creature = %event.creature_id, rarity = %event.rarity,
                    "stored summon"
                );
                processed.inserted += 1;
            }
            Insert::AlreadyExists => {
                tracing::debug!(tx = %event.transaction_hash, "summon already stored");
                processed.duplicates += 1;
            }
        }
    }

    Ok(processed)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            database::{Filter, Sqlite},
            indexer::{adapter::tests::summon_log, chain::mock::MockChain},
        },
        solabi::ethprim::Address,
    };

    fn adapter() -> Adapter {
        Adapter::new(Address([0; 20])).unwrap()
    }

    #[tokio::test]
    async fn processes_range_idempotently() {
        let chain = MockChain::with_logs(vec![
            summon_log(101, 1, 0x11, 5, 1, 1_700_000_000),
            summon_log(102, 2, 0x22, 1200, 2, 1_700_000_012),
            summon_log(200, 3, 0x33, 1620, 3, 1_700_000_024),
        ]);
        let mut database = Sqlite::new_for_test();
        let range = Range { from: 100, to: 150 };

        let processed = process(&chain, &mut database, &adapter(), range)
            .await
            .unwrap();
        assert_eq!(
            processed,
            Processed {
                logs: 2,
                inserted: 2,
                ..Default::default()
            }
        );

        let processed = process(&chain, &mut database, &adapter(), range)
            .await
            .unwrap();
        assert_eq!(
            processed,
            Processed {
                logs: 2,
                duplicates: 2,
                ..Default::default()
            }
        );

        let stats = database
            .aggregate_by_address(&Filter::default())
            .await
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(
            database.cursor().await.unwrap().unwrap().last_processed_block,
            150
        );
    }

    #[tokio::test]
    async fn skips_malformed_logs() {
        let mut missing_hash = summon_log(101, 1, 0x11, 5, 1, 0);
        missing_hash.transaction_hash = None;
        let chain = MockChain::with_logs(vec![
            missing_hash,
            summon_log(102, 2, 0x22, 5, 0, 0),
            summon_log(103, 3, 0x33, 5, 1, 0),
        ]);
        let mut database = Sqlite::new_for_test();

        let processed = process(
            &chain,
            &mut database,
            &adapter(),
            Range { from: 100, to: 110 },
        )
        .await
        .unwrap();
        assert_eq!(
            processed,
            Processed {
                logs: 3,
                inserted: 1,
                skipped: 2,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn skips_unstorable_logs() {
        let mut missing_creature = summon_log(101, 1, 0x11, 1620, 1, 0);
        missing_creature.topics.pop();
        let chain = MockChain::with_logs(vec![
            missing_creature,
            summon_log(102, 2, 0x22, 5, 1, u64::MAX),
            summon_log(103, 3, 0x33, 5, 1, i64::MAX as u64 + 1),
            summon_log(104, 4, 0x44, 5, 1, crate::event::MAX_TIMESTAMP + 1),
            summon_log(105, 5, 0x55, 5, 1, crate::event::MAX_TIMESTAMP),
        ]);
        let mut database = Sqlite::new_for_test();

        let processed = process(
            &chain,
            &mut database,
            &adapter(),
            Range { from: 100, to: 110 },
        )
        .await
        .unwrap();
        assert_eq!(
            processed,
            Processed {
                logs: 5,
                inserted: 1,
                skipped: 4,
                ..Default::default()
            }
        );

        let stored = database.recent(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].block_number, 105);
        assert_eq!(
            database.cursor().await.unwrap().unwrap().last_processed_block,
            110
        );
    }

    #[tokio::test]
    async fn failed_store_leaves_nothing_behind() {
        let chain = MockChain::with_logs(vec![summon_log(101, 1, 0x11, 5, 1, 0)]);
        let mut database = Sqlite::new_for_test();
        database
            .connection()
            .execute_batch(
                "CREATE TRIGGER fail_cursor BEFORE INSERT ON _indexer_cursor \
                 BEGIN SELECT RAISE(ABORT, 'injected fault'); END;",
            )
            .unwrap();

        let result = process(
            &chain,
            &mut database,
            &adapter(),
            Range { from: 100, to: 110 },
        )
        .await;
        assert!(result.is_err());

        assert_eq!(database.cursor().await.unwrap(), None);
        assert_eq!(database.global_stats().await.unwrap().total_summons, 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_nothing_behind() {
        let chain = MockChain {
            fail_logs: true,
            ..MockChain::with_logs(vec![summon_log(101, 1, 0x11, 5, 1, 0)])
        };
        let mut database = Sqlite::new_for_test();

        let result = process(
            &chain,
            &mut database,
            &adapter(),
            Range { from: 100, to: 110 },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(database.cursor().await.unwrap(), None);
    }
}
