use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::committee::Committee;
use super::message::{AppProposal, Block, BlockHeader, GlobalBlockNumber, RoadIndex};
use super::qc::FullCommitQc;
use crate::common::crypto::{Hash, Hashable};
use crate::common::{ctx, Ctx, Error, Guarded, IndexQueue, Result, VerifyError};

/*
    The global data state turns the stream of commit QCs into one sequence
    of numbered blocks. Four indices only ever move forward:

        first <= next_app <= next_block <= next_qc

    Blocks below `first` are pruned. Headers up to `next_qc` are known from
    commit QCs, bodies up to `next_block` are known too, and execution has
    reported app hashes up to `next_app`.
*/

struct Slot {
    header: BlockHeader,
    /// Road index of the commit QC that finalized this block.
    road_index: RoadIndex,
    block: Option<Block>,
}

struct Inner {
    /// Full commit QCs by road index.
    qcs: IndexQueue<FullCommitQc>,
    /// Finalized blocks by global number. `blocks.next()` is `next_qc`.
    blocks: IndexQueue<Slot>,
    next_block: GlobalBlockNumber,
    next_app: GlobalBlockNumber,
    app_proposals: BTreeMap<GlobalBlockNumber, (AppProposal, Instant)>,
    latest_app: Option<AppProposal>,
}

impl Inner {
    /// Moves `next_block` over every slot that has its body.
    fn advance(&mut self) -> bool {
        let before = self.next_block;
        while self.blocks.get(self.next_block).is_some_and(|s| s.block.is_some()) {
            self.next_block += 1;
        }
        self.next_block != before
    }

    fn fill(&mut self, qc: &FullCommitQc, bodies: &HashMap<Hash, Block>) {
        for (n, header) in qc.numbered() {
            let Some(slot) = self.blocks.get_mut(n) else {
                continue;
            };
            if slot.block.is_none() {
                if let Some(body) = bodies.get(&header.hash()) {
                    slot.block = Some(body.clone());
                }
            }
        }
    }

    fn prune(&mut self, below: GlobalBlockNumber) {
        if !self.blocks.prune(below) {
            return;
        }
        let mut drop_qcs = self.qcs.first();
        while self.qcs.get(drop_qcs).is_some_and(|qc| qc.qc.global_range().next <= below) {
            drop_qcs += 1;
        }
        self.qcs.prune(drop_qcs);
        self.app_proposals = self.app_proposals.split_off(&below);
        self.next_block = self.next_block.max(below);
        self.next_app = self.next_app.max(below);
    }
}

pub struct DataState {
    committee: Arc<Committee>,
    cache_window: u64,
    inner: Guarded<Inner>,
}

impl DataState {
    pub fn new(committee: Arc<Committee>, cache_window: u64) -> Self {
        Self::starting_at(committee, cache_window, 0, 0)
    }

    /// A state whose first commit QC is `road_index`, finalizing blocks
    /// from `global_first` on. Used after a restart, when the earlier
    /// history has been pruned away.
    pub fn starting_at(
        committee: Arc<Committee>,
        cache_window: u64,
        road_index: RoadIndex,
        global_first: GlobalBlockNumber,
    ) -> Self {
        DataState {
            committee,
            cache_window: cache_window.max(1),
            inner: Guarded::new(Inner {
                qcs: IndexQueue::starting_at(road_index),
                blocks: IndexQueue::starting_at(global_first),
                next_block: global_first,
                next_app: global_first,
                app_proposals: BTreeMap::new(),
                latest_app: None,
            }),
        }
    }

    /// Accepts the next full commit QC along with whatever block bodies are
    /// at hand. Waits until the previous road index is in and the QC's
    /// blocks fall within the cache window past the execution frontier.
    /// Bodies that match no finalized header are dropped.
    pub async fn push_qc(&self, ctx: &Ctx, qc: FullCommitQc, bodies: Vec<Block>) -> Result<()> {
        let index = qc.qc.index();
        let range = qc.qc.global_range();
        let fresh = self
            .inner
            .wait_for(ctx, |inner| {
                if index < inner.qcs.next() {
                    return Some(false);
                }
                let in_window = range.first < inner.next_app + self.cache_window;
                (index == inner.qcs.next() && in_window).then_some(true)
            })
            .await?;
        if fresh {
            qc.verify(&self.committee)?;
        }

        let bodies: HashMap<Hash, Block> = bodies
            .into_iter()
            .filter(|b| b.verify(&self.committee).is_ok())
            .map(|b| (b.hash(), b))
            .collect();
        let advanced = self.inner.update(|inner| -> Result<bool> {
            if fresh && index == inner.qcs.next() {
                if range.first != inner.blocks.next() {
                    return Err(VerifyError::BadRange(format!(
                        "commit QC {index} starts at global {}, expected {}",
                        range.first,
                        inner.blocks.next()
                    ))
                    .into());
                }
                for (_, header) in qc.numbered() {
                    inner.blocks.push_back(Slot {
                        header: header.clone(),
                        road_index: index,
                        block: None,
                    });
                }
                inner.fill(&qc, &bodies);
                inner.qcs.push_back(qc);
            } else if let Some(known) = inner.qcs.get(index).cloned() {
                inner.fill(&known, &bodies);
            }
            Ok(inner.advance())
        })?;
        if advanced {
            debug!(index, next_block = self.next_block(), "global blocks available");
        }
        Ok(())
    }

    /// Supplies the body of finalized block `n`.
    pub fn push_block(&self, n: GlobalBlockNumber, block: Block) -> Result<()> {
        block.verify(&self.committee)?;
        self.inner.update(|inner| {
            if n < inner.blocks.first() {
                return Ok(());
            }
            let next = inner.blocks.next();
            let slot = inner
                .blocks
                .get_mut(n)
                .ok_or(Error::NotAvailable { requested: n, next })?;
            if slot.header.hash() != block.hash() {
                return Err(VerifyError::HashMismatch(format!("block {n} does not match its finalized header")).into());
            }
            if slot.block.is_none() {
                slot.block = Some(block);
                inner.advance();
            }
            Ok(())
        })
    }

    /// Finalized block `n`, waiting until its body is available.
    pub async fn block(&self, ctx: &Ctx, n: GlobalBlockNumber) -> Result<Block> {
        self.inner
            .wait_for(ctx, |inner| {
                if n < inner.blocks.first() {
                    return Some(Err(Error::Pruned {
                        requested: n,
                        first: inner.blocks.first(),
                    }));
                }
                inner.blocks.get(n)?.block.clone().map(Ok)
            })
            .await?
    }

    /// The full commit QC that finalized block `n`, waiting for it.
    pub async fn qc_for(&self, ctx: &Ctx, n: GlobalBlockNumber) -> Result<FullCommitQc> {
        self.inner
            .wait_for(ctx, |inner| {
                if n < inner.blocks.first() {
                    return Some(Err(Error::Pruned {
                        requested: n,
                        first: inner.blocks.first(),
                    }));
                }
                let slot = inner.blocks.get(n)?;
                inner.qcs.get(slot.road_index).cloned().map(Ok)
            })
            .await?
    }

    /// Records that executing every block up to and including `n` yields
    /// `app_hash`, and returns the app proposal to vote on.
    pub fn push_app_hash(&self, n: GlobalBlockNumber, app_hash: Hash) -> Result<AppProposal> {
        let proposal = self.inner.update(|inner| {
            if n < inner.next_app {
                return Err(Error::OutOfOrder {
                    got: n,
                    expected: inner.next_app,
                });
            }
            if n >= inner.next_block {
                return Err(Error::NotAvailable {
                    requested: n,
                    next: inner.next_block,
                });
            }
            let slot = inner.blocks.get(n).ok_or(Error::Pruned {
                requested: n,
                first: inner.blocks.first(),
            })?;
            let proposal = AppProposal {
                global_number: n,
                road_index: slot.road_index,
                app_hash,
            };
            inner.app_proposals.insert(n, (proposal.clone(), Instant::now()));
            inner.latest_app = Some(proposal.clone());
            inner.next_app = n + 1;
            Ok(proposal)
        })?;
        debug!(global = n, road_index = proposal.road_index, "app hash");
        Ok(proposal)
    }

    pub fn latest_app_proposal(&self) -> Option<AppProposal> {
        self.inner.read(|inner| inner.latest_app.clone())
    }

    /// Blocks until there is an app proposal past `after`, returning the
    /// latest one.
    pub async fn wait_for_app_proposal(&self, ctx: &Ctx, after: Option<GlobalBlockNumber>) -> Result<AppProposal> {
        self.inner
            .wait_for(ctx, |inner| {
                inner
                    .latest_app
                    .as_ref()
                    .filter(|p| after.map_or(true, |a| p.global_number > a))
                    .cloned()
            })
            .await
    }

    pub fn first(&self) -> GlobalBlockNumber {
        self.inner.read(|inner| inner.blocks.first())
    }

    pub fn next_block(&self) -> GlobalBlockNumber {
        self.inner.read(|inner| inner.next_block)
    }

    pub fn next_qc(&self) -> GlobalBlockNumber {
        self.inner.read(|inner| inner.blocks.next())
    }

    pub fn next_app(&self) -> GlobalBlockNumber {
        self.inner.read(|inner| inner.next_app)
    }

    /// Road index of the next commit QC this state expects.
    pub fn next_road_index(&self) -> RoadIndex {
        self.inner.read(|inner| inner.qcs.next())
    }

    /// Blocks until the commit QC at `index` is in.
    pub async fn wait_for_road_index(&self, ctx: &Ctx, index: RoadIndex) -> Result<()> {
        self.inner.wait_for(ctx, |inner| (inner.qcs.next() > index).then_some(())).await
    }

    /// Blocks until the header of block `n` is known.
    pub async fn wait_for_header(&self, ctx: &Ctx, n: GlobalBlockNumber) -> Result<()> {
        self.inner.wait_for(ctx, |inner| (inner.blocks.next() > n).then_some(())).await
    }

    /// Blocks until `next_block` moves past `n`.
    pub async fn wait_for_next_block(&self, ctx: &Ctx, n: GlobalBlockNumber) -> Result<()> {
        self.inner.wait_for(ctx, |inner| (inner.next_block > n).then_some(())).await
    }

    /// Deletes every app proposal, and the blocks and commit QCs up to it,
    /// once it is older than `retention`.
    pub async fn run_pruning(&self, ctx: &Ctx, retention: Duration) -> Result<()> {
        loop {
            let (n, created) = self
                .inner
                .wait_for(ctx, |inner| {
                    inner
                        .app_proposals
                        .iter()
                        .next()
                        .map(|(n, (_, created))| (*n, *created))
                })
                .await?;
            let due = created + retention;
            let now = Instant::now();
            if due > now {
                ctx::sleep(ctx, due - now).await?;
            }
            let first = self.inner.update(|inner| {
                // Everything up to the newest expired proposal goes at once.
                let now = Instant::now();
                let expired = inner
                    .app_proposals
                    .iter()
                    .take_while(|(_, (_, created))| *created + retention <= now)
                    .map(|(n, _)| *n)
                    .last()
                    .unwrap_or(n);
                inner.prune(expired + 1);
                inner.blocks.first()
            });
            info!(first, "pruned global data");
        }
    }
}
