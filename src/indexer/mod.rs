//! Ethereum event indexer for `CreatureSummoned` events.

mod adapter;
mod chain;
mod planner;
mod processor;
mod retry;
mod shutdown;

pub use self::{
    chain::Chain,
    planner::Planner,
    retry::Strategy,
    shutdown::{channel, Shutdown},
};
use self::{
    adapter::Adapter,
    chain::{ChainError, Tag},
    planner::Range,
    processor::Processed,
    retry::Backoff,
};
use crate::database::Database;
use solabi::ethprim::Address;
use std::time::Duration;
use tokio::time;

/// The indexer run configuration.
#[derive(Clone, Copy, Debug)]
pub struct Run {
    /// The chain ID the node is expected to serve.
    pub chain_id: u64,
    pub planner: Planner,
    /// The delay between iterations.
    pub poll_interval: Duration,
    pub retry: Strategy,
    /// Upper bound for exponentially growing retry delays.
    pub max_retry_delay: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("node serves chain {actual} but chain {expected} is configured")]
    ChainMismatch { expected: u64, actual: u64 },
    #[error("failed to read the indexer cursor: {0:#}")]
    Cursor(anyhow::Error),
    #[error("failed to process blocks {range}: {cause:#}")]
    Processing { range: Range, cause: anyhow::Error },
    #[error("finalized head {head} is behind the indexer cursor {cursor}")]
    FinalityRegression { head: u64, cursor: u64 },
}

/// The outcome of an iteration that indexed a block range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Step {
    pub range: Range,
    pub processed: Processed,
}

/// An Ethereum event indexer.
pub struct Indexer<C, D> {
    chain: C,
    database: D,
    adapter: Adapter,
    config: Run,
    backoff: Backoff,
    /// The block tag used for the head, decided by the first successful head lookup.
    finality: Option<Tag>,
}

impl<C, D> Indexer<C, D>
where
    C: Chain,
    D: Database,
{
    /// Creates a new indexer for summons of the specified contract.
    pub fn create(chain: C, database: D, contract: Address, config: Run) -> anyhow::Result<Self> {
        Ok(Self {
            chain,
            database,
            adapter: Adapter::new(contract)?,
            backoff: Backoff::new(config.retry, config.poll_interval, config.max_retry_delay),
            config,
            finality: None,
        })
    }

    /// Runs the indexer until a shutdown is requested, continuously fetching
    /// summons from the blockchain and storing them into the database.
    ///
    /// Transient errors are logged and retried. A finality regression stops
    /// the indexer since it needs operator intervention.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<(), Error> {
        self.init().await?;
        loop {
            if shutdown.requested() {
                break;
            }

            match self.step().await {
                Ok(_) => self.backoff.succeeded(),
                Err(err @ Error::FinalityRegression { .. }) => return Err(err),
                Err(err) => {
                    self.backoff.failed();
                    tracing::error!(
                        %err, failures = self.backoff.failures(),
                        "indexing failed"
                    );
                }
            }

            if shutdown.requested() {
                break;
            }
            tokio::select! {
                _ = time::sleep(self.backoff.delay()) => {}
                _ = shutdown.wait() => break,
            }
        }

        tracing::info!("indexer stopped");
        Ok(())
    }

    /// Verifies the node and logs where indexing resumes.
    async fn init(&mut self) -> Result<(), Error> {
        let actual = self.chain.chain_id().await?;
        if actual != self.config.chain_id {
            return Err(Error::ChainMismatch {
                expected: self.config.chain_id,
                actual,
            });
        }

        let cursor = self.database.cursor().await.map_err(Error::Cursor)?;
        let resume = match cursor {
            Some(cursor) => cursor.last_processed_block.saturating_add(1),
            None => self.config.planner.start_block,
        }
        .max(self.config.planner.start_block);
        tracing::info!(
            chain_id = actual,
            resume,
            poll_interval = ?self.config.poll_interval,
            chunk_size = self.config.planner.chunk_size.get(),
            safe_block_range = ?self.config.planner.safe_block_range,
            "starting indexer"
        );
        Ok(())
    }

    /// Runs a single iteration: reads the cursor and head, then indexes the
    /// next block range if there is one.
    pub async fn step(&mut self) -> Result<Option<Step>, Error> {
        let (cursor, head) = tokio::join!(
            self.database.cursor(),
            head(&self.chain, &mut self.finality),
        );
        let last = cursor
            .map_err(Error::Cursor)?
            .map(|cursor| cursor.last_processed_block);
        let head = head?;

        if let Some(cursor) = last.filter(|cursor| head < *cursor) {
            tracing::error!(
                severity = "critical", %head, %cursor,
                "finalized head is behind the indexer cursor; refusing to continue"
            );
            return Err(Error::FinalityRegression { head, cursor });
        }

        let Some(range) = self.config.planner.plan(last, head) else {
            tracing::debug!(%head, "no new blocks");
            return Ok(None);
        };
        let skipped = self.config.planner.skipped(last, range);
        if skipped > 0 {
            tracing::warn!(
                skipped, from = %range.from,
                "skipping blocks outside of the safe block range"
            );
        }

        tracing::debug!(from = %range.from, to = %range.to, "indexing blocks");
        let processed =
            processor::process(&self.chain, &mut self.database, &self.adapter, range)
                .await
                .map_err(|cause| Error::Processing { range, cause })?;
        tracing::info!(
            from = %range.from, to = %range.to, logs = processed.logs,
            inserted = processed.inserted, duplicates = processed.duplicates,
            skipped = processed.skipped,
            "indexed blocks"
        );

        Ok(Some(Step { range, processed }))
    }
}

/// Reads the finalized head, falling back to the safe head on nodes that do
/// not support the `finalized` tag. The first successful lookup decides the
/// tag for the rest of the process.
async fn head<C>(chain: &C, finality: &mut Option<Tag>) -> Result<u64, ChainError>
where
    C: Chain + ?Sized,
{
    if let Some(tag) = *finality {
        return chain.block_number(tag).await;
    }

    let (tag, block) = match chain.block_number(Tag::Finalized).await {
        Ok(block) => (Tag::Finalized, block),
        Err(ChainError::UnsupportedTag(_)) => {
            tracing::warn!("node does not support the finalized block tag; using safe instead");
            (Tag::Safe, chain.block_number(Tag::Safe).await?)
        }
        Err(err) => return Err(err),
    };
    *finality = Some(tag);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use {
        super::{adapter::tests::summon_log, chain::mock::MockChain, *},
        crate::{
            database::{GlobalStats, Sqlite},
            event::Rarity,
        },
        std::num::NonZeroU64,
    };

    const CHAIN_ID: u64 = 1;

    fn indexer(chain: MockChain) -> Indexer<MockChain, Sqlite> {
        Indexer::create(
            MockChain {
                chain_id: CHAIN_ID,
                ..chain
            },
            Sqlite::new_for_test(),
            Address([0; 20]),
            Run {
                chain_id: CHAIN_ID,
                planner: Planner {
                    start_block: 100,
                    chunk_size: NonZeroU64::new(10).unwrap(),
                    safe_block_range: None,
                },
                poll_interval: Duration::from_secs(3600),
                retry: Strategy::Fixed,
                max_retry_delay: Duration::from_secs(3600),
            },
        )
        .unwrap()
    }

    fn summons() -> MockChain {
        MockChain::with_logs(vec![
            summon_log(101, 1, 0x11, 5, 1, 1_700_000_000),
            summon_log(102, 2, 0x22, 1200, 4, 1_700_000_012),
            summon_log(103, 3, 0x11, 1620, 9, 1_700_000_024),
        ])
    }

    async fn last_processed_block(indexer: &mut Indexer<MockChain, Sqlite>) -> Option<u64> {
        indexer
            .database
            .cursor()
            .await
            .unwrap()
            .map(|cursor| cursor.last_processed_block)
    }

    #[tokio::test]
    async fn indexes_summons() {
        let mut indexer = indexer(summons());
        indexer.chain.set_head(Tag::Finalized, 110);

        let step = indexer.step().await.unwrap().unwrap();
        assert_eq!(step.range, Range { from: 100, to: 109 });
        assert_eq!(step.processed.inserted, 3);

        let step = indexer.step().await.unwrap().unwrap();
        assert_eq!(step.range, Range { from: 110, to: 110 });
        assert_eq!(step.processed.logs, 0);

        assert_eq!(indexer.step().await.unwrap(), None);
        assert_eq!(last_processed_block(&mut indexer).await, Some(110));

        assert_eq!(
            indexer.database.global_stats().await.unwrap(),
            GlobalStats {
                total_summons: 3,
                total_users: 2,
                common: 1,
                rare: 1,
                epic: 0,
                deity: 1,
            }
        );
        let leaderboard = indexer.database.leaderboard(10).await.unwrap();
        assert_eq!(
            leaderboard[0].address,
            format!("0x{}", hex::encode([0x11_u8; 20])),
        );
        assert_eq!(leaderboard[0].deity_count, 1);
        let history = indexer
            .database
            .history(
                &format!("0x{}", hex::encode([0x11_u8; 20])),
                crate::database::Page {
                    limit: 10,
                    skip: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            history
                .events
                .iter()
                .map(|event| event.rarity)
                .collect::<Vec<_>>(),
            [Rarity::Deity, Rarity::Common]
        );
    }

    #[tokio::test]
    async fn reprocessing_is_idempotent() {
        let mut indexer = indexer(summons());
        indexer.chain.set_head(Tag::Finalized, 109);
        indexer.step().await.unwrap();

        // Simulate a crash after the events were stored but before the cursor
        // was advanced by replaying the range against the same store.
        let range = Range { from: 100, to: 109 };
        let processed = processor::process(
            &indexer.chain,
            &mut indexer.database,
            &indexer.adapter,
            range,
        )
        .await
        .unwrap();
        assert_eq!(processed.inserted, 0);
        assert_eq!(processed.duplicates, 3);
        assert_eq!(
            indexer.database.global_stats().await.unwrap().total_summons,
            3
        );
    }

    #[tokio::test]
    async fn stops_on_finality_regression() {
        let mut indexer = indexer(summons());
        indexer.database.update(&[], 200).await.unwrap();
        indexer.chain.set_head(Tag::Finalized, 150);

        assert!(matches!(
            indexer.step().await,
            Err(Error::FinalityRegression {
                head: 150,
                cursor: 200
            })
        ));
        assert_eq!(last_processed_block(&mut indexer).await, Some(200));

        let (_trigger, shutdown) = channel();
        assert!(matches!(
            indexer.run(shutdown).await,
            Err(Error::FinalityRegression { .. })
        ));
        assert_eq!(
            indexer.database.global_stats().await.unwrap().total_summons,
            0
        );
    }

    #[tokio::test]
    async fn falls_back_to_safe_head_once() {
        let mut indexer = indexer(summons());
        indexer.chain.set_head(Tag::Safe, 105);

        let step = indexer.step().await.unwrap().unwrap();
        assert_eq!(step.range, Range { from: 100, to: 105 });
        assert_eq!(indexer.step().await.unwrap(), None);

        assert_eq!(
            *indexer.chain.requests.lock().unwrap(),
            [Tag::Finalized, Tag::Safe, Tag::Safe]
        );
    }

    #[tokio::test]
    async fn rejects_wrong_chain() {
        let mut indexer = indexer(summons());
        indexer.chain.chain_id = 5;
        indexer.chain.set_head(Tag::Finalized, 110);

        let (_trigger, shutdown) = channel();
        assert!(matches!(
            indexer.run(shutdown).await,
            Err(Error::ChainMismatch {
                expected: 1,
                actual: 5
            })
        ));
        assert_eq!(last_processed_block(&mut indexer).await, None);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_shutdown() {
        let mut indexer = indexer(MockChain {
            fail_logs: true,
            ..summons()
        });
        indexer.chain.set_head(Tag::Finalized, 110);

        assert!(matches!(
            indexer.step().await,
            Err(Error::Processing { range: Range { from: 100, to: 109 }, .. })
        ));

        let (trigger, shutdown) = channel();
        let (result, ()) = time::timeout(Duration::from_secs(5), async {
            tokio::join!(indexer.run(shutdown), async {
                time::sleep(Duration::from_millis(50)).await;
                trigger.shutdown();
            })
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(indexer.backoff.failures(), 1);
        assert_eq!(last_processed_block(&mut indexer).await, None);
    }

    #[tokio::test]
    async fn exits_on_shutdown() {
        let mut indexer = indexer(summons());
        indexer.chain.set_head(Tag::Finalized, 110);

        let (trigger, shutdown) = channel();
        trigger.shutdown();
        indexer.run(shutdown).await.unwrap();
        assert_eq!(last_processed_block(&mut indexer).await, None);

        let (trigger, shutdown) = channel();
        time::timeout(Duration::from_secs(5), async {
            tokio::join!(indexer.run(shutdown), async {
                time::sleep(Duration::from_millis(50)).await;
                trigger.shutdown();
            })
        })
        .await
        .unwrap()
        .0
        .unwrap();
        assert_eq!(last_processed_block(&mut indexer).await, Some(109));
    }
}
