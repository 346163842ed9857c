//! Access to the blockchain node. This is the only part of the indexer that
//! talks to the chain.

use {
    ethrpc::{
        eth,
        types::{
            ArrayVec, BlockTag, Digest, Empty, Hydrated, LogBlocks, LogFilter, LogFilterValue,
            U256,
        },
    },
    futures::{future::BoxFuture, FutureExt},
    solabi::ethprim::Address,
    std::fmt::{self, Display, Formatter},
};

ethrpc::method! {
    /// Returns the chain ID of the network the node serves.
    pub struct ChainId as "eth_chainId"
        Empty => U256;
}

/// A block tag the indexer reads the chain head for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Tag {
    Latest,
    Safe,
    Finalized,
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Tag::Latest => "latest",
            Tag::Safe => "safe",
            Tag::Finalized => "finalized",
        })
    }
}

impl From<Tag> for BlockTag {
    fn from(tag: Tag) -> Self {
        match tag {
            Tag::Latest => BlockTag::Latest,
            Tag::Safe => BlockTag::Safe,
            Tag::Finalized => BlockTag::Finalized,
        }
    }
}

/// Selects the logs of a single event emitted by a single contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogQuery {
    pub address: Address,
    /// The event selector, i.e. the first log topic.
    pub topic: Digest,
    pub from: u64,
    pub to: u64,
}

/// A raw log as returned by the node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Log {
    pub block_number: u64,
    pub transaction_hash: Option<Digest>,
    pub topics: Vec<Digest>,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("node does not support the {0} block tag")]
    UnsupportedTag(Tag),
    #[error(transparent)]
    Rpc(#[from] anyhow::Error),
}

/// Blockchain node access. Every call hits the node; nothing is cached.
pub trait Chain: Send + Sync {
    /// Fetches the logs matching the query, in block and log index order.
    fn logs(&self, query: LogQuery) -> BoxFuture<'_, Result<Vec<Log>, ChainError>>;

    /// Returns the number of the block with the specified tag.
    fn block_number(&self, tag: Tag) -> BoxFuture<'_, Result<u64, ChainError>>;

    fn chain_id(&self) -> BoxFuture<'_, Result<u64, ChainError>>;
}

impl Chain for ethrpc::http::Client {
    fn logs(&self, query: LogQuery) -> BoxFuture<'_, Result<Vec<Log>, ChainError>> {
        async move {
            let filter = LogFilter {
                address: LogFilterValue::Exact(query.address),
                topics: {
                    let mut topics = ArrayVec::<_, 4>::new();
                    topics.push(LogFilterValue::Exact(query.topic));
                    topics
                },
                blocks: LogBlocks::Range {
                    from: query.from.into(),
                    to: query.to.into(),
                },
            };
            let logs = self
                .execute(eth::GetLogs, (filter,))
                .await
                .map_err(anyhow::Error::from)?;

            logs.into_iter()
                .map(|log| {
                    Ok(Log {
                        block_number: to_u64(log.block_number)?,
                        transaction_hash: Some(log.transaction_hash),
                        topics: log.topics.to_vec(),
                        data: log.data.to_vec(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        }
        .boxed()
    }

    fn block_number(&self, tag: Tag) -> BoxFuture<'_, Result<u64, ChainError>> {
        async move {
            let block = self
                .execute(eth::GetBlockByNumber, (BlockTag::from(tag).into(), Hydrated::No))
                .await
                .map_err(|err| {
                    let err = anyhow::Error::from(err);
                    if tag != Tag::Latest && rejects_tag(&err, tag) {
                        ChainError::UnsupportedTag(tag)
                    } else {
                        ChainError::Rpc(err)
                    }
                })?;
            match block {
                Some(block) => to_u64(block.number),
                None if tag == Tag::Latest => Err(anyhow::anyhow!("missing latest block").into()),
                None => Err(ChainError::UnsupportedTag(tag)),
            }
        }
        .boxed()
    }

    fn chain_id(&self) -> BoxFuture<'_, Result<u64, ChainError>> {
        async move {
            let id = self
                .execute(ChainId, Empty)
                .await
                .map_err(anyhow::Error::from)?;
            to_u64(id)
        }
        .boxed()
    }
}

fn to_u64(value: U256) -> Result<u64, ChainError> {
    if value > U256::from(u64::MAX) {
        return Err(anyhow::anyhow!("node returned out of range number {value}").into());
    }
    Ok(value.as_u64())
}

/// Nodes that predate the merge (or some L2s) reject the `safe` and
/// `finalized` tags with an error rather than returning no block. Only errors
/// that talk about the tag count; a plain HTTP 404 does not.
fn rejects_tag(err: &anyhow::Error, tag: Tag) -> bool {
    let message = format!("{err:#}").to_lowercase();
    let about_tag = message.contains(&tag.to_string()) || message.contains("block tag");
    let rejected = [
        "not supported",
        "unsupported",
        "not found",
        "unknown",
        "invalid",
    ]
    .iter()
    .any(|pattern| message.contains(pattern));
    about_tag && rejected
}
