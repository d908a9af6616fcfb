use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::committee::Committee;
use super::message::{
    AppVote, Block, BlockNumber, GlobalBlockNumber, LaneId, LaneProposal, LaneVote, Payload, RoadIndex, Signed,
};
use super::qc::{lane_start, AppQc, CommitQc, LaneQc};
use super::store::{BlockStore, CommitQcStore};
use crate::common::crypto::{Hash, Hashable, Keypair, PublicKey};
use crate::common::{Ctx, Error, Guarded, IndexQueue, Result, VerifyError};

/*
    Availability runs underneath consensus. Each replica appends blocks to
    its own lane and streams them to everyone; everyone votes on every
    block they hold, and f + 1 votes on a header make a lane QC. The
    consensus leader only ever proposes lane ranges ending at a lane QC.

    Commit QCs flow back in strictly by road index. Once the committee
    certifies the app hash reached inside commit QC i, everything finalized
    before i is no longer needed and is pruned.
*/

struct Lane {
    blocks: IndexQueue<Signed<LaneProposal>>,
    votes: IndexQueue<BlockVotes>,
    /// Hash of block `blocks.next() - 1`, if known.
    tip: Option<Hash>,
    /// Highest lane QC seen.
    qc: Option<LaneQc>,
}

impl Lane {
    fn starting_at(first: BlockNumber, tip: Option<Hash>) -> Self {
        Lane {
            blocks: IndexQueue::starting_at(first),
            votes: IndexQueue::starting_at(first),
            tip,
            qc: None,
        }
    }
}

#[derive(Default)]
struct BlockVotes {
    signers: HashSet<PublicKey>,
    by_header: HashMap<Hash, Vec<Signed<LaneVote>>>,
    certified: bool,
}

#[derive(Default)]
struct AppVotes {
    by_proposal: HashMap<Hash, Vec<Signed<AppVote>>>,
}

struct Inner {
    lanes: BTreeMap<LaneId, Lane>,
    commit_qcs: IndexQueue<CommitQc>,
    app_votes: BTreeMap<GlobalBlockNumber, AppVotes>,
    app_votes_first: GlobalBlockNumber,
    /// Highest global number each signer has app-voted for.
    app_voted: HashMap<PublicKey, GlobalBlockNumber>,
    app_qc: Option<AppQc>,
}

/// What the per-item stores held at startup.
#[derive(Default)]
pub struct Recovered {
    pub blocks: Vec<Signed<LaneProposal>>,
    pub commit_qcs: Vec<CommitQc>,
}

#[derive(Clone)]
pub struct Stores {
    pub blocks: Arc<BlockStore>,
    pub commit_qcs: Arc<CommitQcStore>,
}

pub struct AvailabilityState {
    committee: Arc<Committee>,
    keypair: Arc<Keypair>,
    lane_capacity: usize,
    inner: Guarded<Inner>,
    latest_commit_qc: watch::Sender<Option<CommitQc>>,
    latest_app_qc: watch::Sender<Option<AppQc>>,
    stores: Option<Stores>,
}

impl AvailabilityState {
    pub fn new(
        committee: Arc<Committee>,
        keypair: Arc<Keypair>,
        lane_capacity: usize,
        stores: Option<Stores>,
        recovered: Recovered,
    ) -> Self {
        let commit_qcs = Self::recover_commit_qcs(&committee, recovered.commit_qcs);
        let lanes = Self::recover_lanes(&committee, commit_qcs.last(), recovered.blocks);
        let latest = commit_qcs.last().cloned();
        if let Some(qc) = &latest {
            info!(index = qc.index(), "recovered commit QCs");
        }
        AvailabilityState {
            committee,
            keypair,
            lane_capacity: lane_capacity.max(1),
            inner: Guarded::new(Inner {
                lanes,
                commit_qcs,
                app_votes: BTreeMap::new(),
                app_votes_first: 0,
                app_voted: HashMap::new(),
                app_qc: None,
            }),
            latest_commit_qc: watch::channel(latest).0,
            latest_app_qc: watch::channel(None).0,
            stores,
        }
    }

    fn recover_commit_qcs(committee: &Committee, qcs: Vec<CommitQc>) -> IndexQueue<CommitQc> {
        let mut queue = match qcs.first() {
            Some(qc) => IndexQueue::starting_at(qc.index()),
            None => IndexQueue::new(),
        };
        for qc in qcs {
            if qc.index() != queue.next() || qc.verify(committee).is_err() {
                warn!(index = qc.index(), "dropping unusable recovered commit QC and everything after it");
                break;
            }
            queue.push_back(qc);
        }
        queue
    }

    fn recover_lanes(
        committee: &Committee,
        latest: Option<&CommitQc>,
        blocks: Vec<Signed<LaneProposal>>,
    ) -> BTreeMap<LaneId, Lane> {
        let mut by_lane: BTreeMap<LaneId, Vec<Signed<LaneProposal>>> = BTreeMap::new();
        for block in blocks {
            let header = &block.msg.block.header;
            let valid = block.signer() == &header.lane
                && block.verify(committee).is_ok()
                && block.msg.block.verify(committee).is_ok();
            if !valid {
                warn!(lane = ?header.lane, number = header.block_number, "dropping invalid recovered block");
                continue;
            }
            by_lane.entry(header.lane).or_default().push(block);
        }
        committee
            .replicas()
            .iter()
            .map(|lane| {
                let mut blocks = by_lane.remove(lane).unwrap_or_default();
                blocks.sort_by_key(|b| b.msg.block.header.block_number);
                let (start, start_hash) = lane_start(latest, lane);
                let mut state = match blocks.first() {
                    Some(b) => {
                        let first = b.msg.block.header.block_number;
                        Lane::starting_at(first, (first == 0).then_some(Hash::ZERO))
                    }
                    None => Lane::starting_at(start, Some(start_hash)),
                };
                for block in blocks {
                    let header = &block.msg.block.header;
                    let linked = state.tip.map_or(true, |tip| tip == header.parent_hash);
                    if header.block_number != state.blocks.next() || !linked {
                        break;
                    }
                    state.tip = Some(header.hash());
                    state.blocks.push_back(block);
                }
                (*lane, state)
            })
            .collect()
    }

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    /// Appends a new block to this replica's lane, waiting for room.
    pub async fn produce_block(&self, ctx: &Ctx, payload: Payload) -> Result<Signed<LaneProposal>> {
        let me = self.keypair.pubkey();
        let cap = self.lane_capacity;
        self.inner
            .wait(ctx, |inner| {
                let lane = match inner.lanes.get_mut(&me) {
                    Some(lane) => lane,
                    None => return Some(Err(VerifyError::NotMember(me).into())),
                };
                if lane.blocks.len() >= cap {
                    return None;
                }
                let Some(parent) = lane.tip else {
                    return Some(Err(Error::Corrupt("own lane is behind its finalized range".into())));
                };
                let block = Block::new(me, lane.blocks.next(), parent, payload.clone());
                let signed = Signed::new(LaneProposal { block }, &self.keypair);
                lane.tip = Some(signed.msg.block.hash());
                lane.blocks.push_back(signed.clone());
                Some(Ok(signed))
            })
            .await?
            .map(|signed| {
                debug!(number = signed.msg.block.header.block_number, "produced block");
                signed
            })
    }

    /// Ingests a block announced by its lane's producer.
    pub async fn push_block(&self, ctx: &Ctx, proposal: Signed<LaneProposal>) -> Result<()> {
        let header = proposal.msg.block.header.clone();
        header.verify(&self.committee)?;
        if proposal.signer() != &header.lane {
            return Err(VerifyError::WrongLane {
                lane: header.lane,
                signer: *proposal.signer(),
            }
            .into());
        }
        proposal.verify(&self.committee)?;
        proposal.msg.block.verify(&self.committee)?;

        let cap = self.lane_capacity;
        let hash = header.hash();
        let n = header.block_number;
        self.inner
            .wait(ctx, |inner| {
                let lane = inner.lanes.get_mut(&header.lane)?;
                if n < lane.blocks.first() {
                    return Some(Ok(()));
                }
                if let Some(existing) = lane.blocks.get(n) {
                    if existing.msg.block.hash() != hash {
                        warn!(lane = ?header.lane, number = n, "equivocating block dropped");
                    }
                    return Some(Ok(()));
                }
                if n > lane.blocks.next() || lane.blocks.len() >= cap {
                    return None;
                }
                if let Some(tip) = lane.tip {
                    if tip != header.parent_hash {
                        return Some(Err(Error::from(VerifyError::HashMismatch(format!(
                            "block {n} of lane {:?} does not extend the lane",
                            header.lane
                        )))));
                    }
                }
                lane.tip = Some(hash);
                lane.blocks.push_back(proposal.clone());
                Some(Ok(()))
            })
            .await?
    }

    /// Counts a lane vote. Returns the lane QC the first time the header
    /// reaches the lane quorum.
    pub async fn push_vote(&self, ctx: &Ctx, vote: Signed<LaneVote>) -> Result<Option<LaneQc>> {
        vote.verify(&self.committee)?;
        vote.msg.header.verify(&self.committee)?;

        let window = self.lane_capacity as u64;
        let quorum = self.committee.quorums().lane;
        let lane_id = vote.msg.header.lane;
        let n = vote.msg.header.block_number;
        let hash = vote.msg.header.hash();
        let signer = *vote.signer();
        self.inner
            .wait(ctx, |inner| {
                let lane = inner.lanes.get_mut(&lane_id)?;
                if n < lane.votes.first() {
                    return Some(None);
                }
                if n >= lane.votes.first() + window {
                    return None;
                }
                let entry = lane.votes.get_or_fill(n, BlockVotes::default)?;
                if !entry.signers.insert(signer) {
                    return Some(None);
                }
                let votes = entry.by_header.entry(hash).or_default();
                votes.push(vote.clone());
                if entry.certified || votes.len() < quorum {
                    return Some(None);
                }
                entry.certified = true;
                let Some(qc) = LaneQc::from_votes(votes) else {
                    return Some(None);
                };
                if lane.qc.as_ref().map_or(true, |q| q.header().block_number < n) {
                    lane.qc = Some(qc.clone());
                }
                Some(Some(qc))
            })
            .await
    }

    /// Records a lane QC learned some other way, e.g. from a proposal.
    pub fn push_lane_qc(&self, qc: &LaneQc) -> Result<()> {
        qc.verify(&self.committee)?;
        let n = qc.header().block_number;
        self.inner.update(|inner| {
            if let Some(lane) = inner.lanes.get_mut(&qc.header().lane) {
                if lane.qc.as_ref().map_or(true, |q| q.header().block_number < n) {
                    lane.qc = Some(qc.clone());
                }
            }
        });
        Ok(())
    }

    /// Blocks until some lane has a lane QC beyond what `prev` finalized.
    /// Returns the highest QC of every such lane.
    pub async fn wait_for_lane_qcs(&self, ctx: &Ctx, prev: Option<&CommitQc>) -> Result<BTreeMap<LaneId, LaneQc>> {
        self.inner
            .wait_for(ctx, |inner| {
                let fresh = Self::fresh_lane_qcs(inner, prev);
                (!fresh.is_empty()).then_some(fresh)
            })
            .await
    }

    /// The lane QCs beyond what `prev` finalized, possibly none.
    pub fn lane_qcs(&self, prev: Option<&CommitQc>) -> BTreeMap<LaneId, LaneQc> {
        self.inner.read(|inner| Self::fresh_lane_qcs(inner, prev))
    }

    fn fresh_lane_qcs(inner: &Inner, prev: Option<&CommitQc>) -> BTreeMap<LaneId, LaneQc> {
        inner
            .lanes
            .iter()
            .filter_map(|(id, lane)| {
                let qc = lane.qc.as_ref()?;
                (qc.header().block_number >= lane_start(prev, id).0).then(|| (*id, qc.clone()))
            })
            .collect()
    }

    /// Accepts the commit QC for the next road index. Waits for the
    /// previous index first; duplicates are ignored.
    pub async fn push_commit_qc(&self, ctx: &Ctx, qc: CommitQc) -> Result<()> {
        qc.verify(&self.committee)?;
        let index = qc.index();
        let inserted = self
            .inner
            .wait(ctx, |inner| {
                if index < inner.commit_qcs.next() {
                    if let Some(existing) = inner.commit_qcs.get(index) {
                        if existing.hash() != qc.hash() {
                            warn!(index, "conflicting commit QC ignored");
                        }
                    }
                    return Some(Ok(false));
                }
                if index > inner.commit_qcs.next() {
                    return None;
                }
                if let Err(e) = Self::check_contiguous(inner.commit_qcs.last(), &qc) {
                    return Some(Err(e));
                }
                inner.commit_qcs.push_back(qc.clone());
                Some(Ok(true))
            })
            .await??;
        if inserted {
            let range = qc.global_range();
            info!(index, first = range.first, next = range.next, "commit QC");
            self.latest_commit_qc.send_replace(Some(qc));
        }
        Ok(())
    }

    fn check_contiguous(prev: Option<&CommitQc>, qc: &CommitQc) -> Result<()> {
        for range in &qc.proposal().lane_ranges {
            let (first, _) = lane_start(prev, &range.lane);
            let expected_first = match prev {
                Some(_) => first,
                // Recovery may start the window past genesis with no
                // predecessor to compare against.
                None => range.first,
            };
            if range.first != expected_first {
                return Err(VerifyError::BadRange(format!(
                    "commit QC {} leaves a gap in lane {:?}",
                    qc.index(),
                    range.lane
                ))
                .into());
            }
        }
        Ok(())
    }

    pub fn latest_commit_qc(&self) -> Option<CommitQc> {
        self.latest_commit_qc.borrow().clone()
    }

    pub fn subscribe_commit_qc(&self) -> watch::Receiver<Option<CommitQc>> {
        self.latest_commit_qc.subscribe()
    }

    pub fn latest_app_qc(&self) -> Option<AppQc> {
        self.latest_app_qc.borrow().clone()
    }

    pub fn subscribe_app_qc(&self) -> watch::Receiver<Option<AppQc>> {
        self.latest_app_qc.subscribe()
    }

    /// Blocks until the latest app QC is newer than `after` and certifies a
    /// block below `before`.
    pub async fn wait_for_app_qc(
        &self,
        ctx: &Ctx,
        after: Option<GlobalBlockNumber>,
        before: GlobalBlockNumber,
    ) -> Result<AppQc> {
        self.inner
            .wait_for(ctx, |inner| {
                inner
                    .app_qc
                    .as_ref()
                    .filter(|qc| after.map_or(true, |a| qc.global_number() > a) && qc.global_number() < before)
                    .cloned()
            })
            .await
    }

    /// The commit QC at `index`, waiting for it if needed.
    pub async fn commit_qc(&self, ctx: &Ctx, index: RoadIndex) -> Result<CommitQc> {
        self.inner
            .wait_for(ctx, |inner| {
                let q = &inner.commit_qcs;
                if index < q.first() {
                    return Some(Err(Error::Pruned {
                        requested: index,
                        first: q.first(),
                    }));
                }
                q.get(index).cloned().map(Ok)
            })
            .await?
    }

    /// Block `n` of `lane`, waiting for it if needed.
    pub async fn block(&self, ctx: &Ctx, lane: &LaneId, n: BlockNumber) -> Result<Signed<LaneProposal>> {
        self.inner
            .wait_for(ctx, |inner| {
                let blocks = &inner.lanes.get(lane)?.blocks;
                if n < blocks.first() {
                    return Some(Err(Error::Pruned {
                        requested: n,
                        first: blocks.first(),
                    }));
                }
                blocks.get(n).cloned().map(Ok)
            })
            .await?
    }

    /// The first retained block of `lane` numbered `n` or higher, skipping
    /// over anything already pruned.
    pub async fn next_block(&self, ctx: &Ctx, lane: &LaneId, n: BlockNumber) -> Result<Signed<LaneProposal>> {
        self.inner
            .wait_for(ctx, |inner| {
                let blocks = &inner.lanes.get(lane)?.blocks;
                blocks.get(n.max(blocks.first())).cloned()
            })
            .await
    }

    /// Counts an app vote once the commit QC it refers to is known.
    /// Reaching the app quorum prunes history.
    pub async fn push_app_vote(&self, ctx: &Ctx, vote: Signed<AppVote>) -> Result<Option<AppQc>> {
        vote.verify(&self.committee)?;
        let proposal = vote.msg.proposal.clone();
        let commit_qc = match self.commit_qc(ctx, proposal.road_index).await {
            Ok(qc) => qc,
            Err(e) if e.is_pruned() => return Ok(None),
            Err(e) => return Err(e),
        };
        if !commit_qc.global_range().contains(proposal.global_number) {
            return Err(VerifyError::BadAppProposal(format!(
                "block {} is not finalized by commit QC {}",
                proposal.global_number, proposal.road_index
            ))
            .into());
        }

        let quorum = self.committee.quorums().app;
        let signer = *vote.signer();
        let n = proposal.global_number;
        let key = proposal.hash();
        let app_qc = self.inner.update(|inner| {
            if n < inner.app_votes_first {
                return None;
            }
            if inner.app_voted.get(&signer).is_some_and(|&prev| prev >= n) {
                return None;
            }
            inner.app_voted.insert(signer, n);
            let votes = inner.app_votes.entry(n).or_default().by_proposal.entry(key).or_default();
            votes.push(vote.clone());
            if votes.len() < quorum {
                return None;
            }
            AppQc::from_votes(votes)
        });
        match app_qc {
            Some(app_qc) => {
                self.prune(&app_qc, &commit_qc)?;
                Ok(Some(app_qc))
            }
            None => Ok(None),
        }
    }

    /// Accepts an app QC with the commit QC it refers to, and prunes.
    /// The pair may be ahead of the local commit QCs, in which case the
    /// window skips forward to `commit_qc`.
    pub fn push_app_qc(&self, app_qc: AppQc, commit_qc: CommitQc) -> Result<()> {
        app_qc.verify(&self.committee)?;
        commit_qc.verify(&self.committee)?;
        self.prune(&app_qc, &commit_qc)
    }

    /// Drops everything finalized before `commit_qc`, given the app QC
    /// certified at that same index.
    pub fn prune(&self, app_qc: &AppQc, commit_qc: &CommitQc) -> Result<()> {
        if app_qc.road_index() != commit_qc.index() {
            return Err(VerifyError::IndexMismatch {
                expected: commit_qc.index(),
                got: app_qc.road_index(),
            }
            .into());
        }
        if !commit_qc.global_range().contains(app_qc.global_number()) {
            return Err(VerifyError::BadAppProposal(format!(
                "app QC for block {} outside commit QC {}",
                app_qc.global_number(),
                commit_qc.index()
            ))
            .into());
        }
        let index = commit_qc.index();
        let jumped = self.inner.update(|inner| {
            if inner.app_qc.as_ref().is_some_and(|qc| qc.global_number() >= app_qc.global_number()) {
                return None;
            }
            inner.app_qc = Some(app_qc.clone());

            let jumped = inner.commit_qcs.next() <= index;
            inner.commit_qcs.prune(index);
            if jumped {
                inner.commit_qcs.push_back(commit_qc.clone());
            }

            for range in &commit_qc.proposal().lane_ranges {
                let Some(lane) = inner.lanes.get_mut(&range.lane) else {
                    continue;
                };
                // A lane that is behind skips straight past this commit QC,
                // whose range end is the only hash known for it.
                let keep_from = if lane.blocks.next() < range.first {
                    lane.tip = Some(range.last_hash);
                    range.next
                } else {
                    range.first
                };
                lane.blocks.prune(keep_from);
                lane.votes.prune(keep_from);
            }

            inner.app_votes = inner.app_votes.split_off(&(app_qc.global_number() + 1));
            inner.app_votes_first = app_qc.global_number() + 1;
            Some(jumped)
        });
        let Some(jumped) = jumped else {
            return Ok(());
        };
        info!(index, global = app_qc.global_number(), "pruned");
        self.latest_app_qc.send_replace(Some(app_qc.clone()));
        if jumped {
            self.latest_commit_qc.send_replace(Some(commit_qc.clone()));
        }
        Ok(())
    }

    /// First retained commit QC index and the next one expected.
    pub fn commit_qc_window(&self) -> (RoadIndex, RoadIndex) {
        self.inner.read(|inner| (inner.commit_qcs.first(), inner.commit_qcs.next()))
    }

    /// First retained block number and next block number of `lane`.
    pub fn lane_window(&self, lane: &LaneId) -> Option<(BlockNumber, BlockNumber)> {
        self.inner
            .read(|inner| inner.lanes.get(lane).map(|l| (l.blocks.first(), l.blocks.next())))
    }

    /// Writes blocks and commit QCs to the per-item stores as they arrive,
    /// and deletes files once their items are pruned. Returns immediately
    /// if persistence is disabled.
    pub async fn run_persist(&self, ctx: &Ctx) -> Result<()> {
        let Some(stores) = self.stores.clone() else {
            return Ok(());
        };
        let mut lanes: BTreeMap<LaneId, (BlockNumber, BlockNumber)> =
            self.inner.read(|inner| inner.lanes.iter().map(|(id, l)| (*id, (l.blocks.first(), l.blocks.next()))).collect());
        let mut qcs = self.commit_qc_window();
        loop {
            let work = self
                .inner
                .wait_for(ctx, |inner| {
                    let mut blocks = Vec::new();
                    let mut pruned = Vec::new();
                    for (id, lane) in &inner.lanes {
                        let (first, next) = lanes.get(id).copied().unwrap_or_default();
                        for n in next.max(lane.blocks.first())..lane.blocks.next() {
                            blocks.extend(lane.blocks.get(n).cloned());
                        }
                        if lane.blocks.first() > first {
                            pruned.push((*id, lane.blocks.first()));
                        }
                    }
                    let new_qcs: Vec<_> = (qcs.1.max(inner.commit_qcs.first())..inner.commit_qcs.next())
                        .filter_map(|i| inner.commit_qcs.get(i).cloned())
                        .collect();
                    let qc_first = inner.commit_qcs.first();
                    let idle = blocks.is_empty() && pruned.is_empty() && new_qcs.is_empty() && qc_first <= qcs.0;
                    (!idle).then_some((blocks, pruned, new_qcs, qc_first))
                })
                .await?;
            let (blocks, pruned, new_qcs, qc_first) = work;

            let task_stores = stores.clone();
            let written = tokio::task::spawn_blocking(move || -> Result<_> {
                for block in &blocks {
                    task_stores.blocks.persist(block)?;
                }
                for qc in &new_qcs {
                    task_stores.commit_qcs.persist(qc)?;
                }
                for (lane, below) in &pruned {
                    task_stores.blocks.prune(lane, *below)?;
                }
                task_stores.commit_qcs.prune(qc_first)?;
                Ok((blocks, pruned, new_qcs))
            })
            .await??;

            let (blocks, pruned, new_qcs) = written;
            for block in &blocks {
                let header = &block.msg.block.header;
                let entry = lanes.entry(header.lane).or_default();
                entry.1 = entry.1.max(header.block_number + 1);
            }
            for (lane, below) in pruned {
                let entry = lanes.entry(lane).or_default();
                entry.0 = below;
                entry.1 = entry.1.max(below);
            }
            if let Some(qc) = new_qcs.last() {
                qcs.1 = qc.index() + 1;
            }
            qcs.0 = qc_first;
            qcs.1 = qcs.1.max(qc_first);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::consensus::message::{AppProposal, View};
    use crate::consensus::qc::testonly::Setup;

    fn state(setup: &Setup, me: usize, cap: usize) -> AvailabilityState {
        let keypair = Arc::new(setup.keys[me].clone());
        AvailabilityState::new(Arc::new(setup.committee.clone()), keypair, cap, None, Recovered::default())
    }

    fn signed(setup: &Setup, block: Block) -> Signed<LaneProposal> {
        let key = setup.key(&block.header.lane);
        Signed::new(LaneProposal { block }, key)
    }

    #[tokio::test]
    async fn test_produce_chains_blocks() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();

        let b0 = avail.produce_block(&ctx, Payload::new(vec![])).await.unwrap();
        let b1 = avail.produce_block(&ctx, Payload::new(vec![])).await.unwrap();
        assert_eq!(b0.msg.block.header.block_number, 0);
        assert_eq!(b0.msg.block.header.parent_hash, Hash::ZERO);
        assert_eq!(b1.msg.block.header.parent_hash, b0.msg.block.hash());
    }

    #[tokio::test]
    async fn test_produce_blocks_at_capacity() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 2);
        let ctx = Ctx::new();
        avail.produce_block(&ctx, Payload::new(vec![])).await.unwrap();
        avail.produce_block(&ctx, Payload::new(vec![])).await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(50), avail.produce_block(&ctx, Payload::new(vec![]))).await;
        assert!(res.is_err(), "third block must wait for room");
    }

    #[tokio::test]
    async fn test_push_block_rejects_wrong_lane() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();
        let block = setup.blocks(1, 0, Hash::ZERO, 1).remove(0);
        let forged = Signed::new(LaneProposal { block }, &setup.keys[2]);

        let err = avail.push_block(&ctx, forged).await.unwrap_err();
        assert!(matches!(err, Error::Verify(VerifyError::WrongLane { .. })));
    }

    #[tokio::test]
    async fn test_push_block_drops_equivocation() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();
        let lane = setup.keys[1].pubkey();
        let original = setup.blocks(1, 0, Hash::ZERO, 1).remove(0);
        let conflicting = Block::new(lane, 0, Hash::ZERO, Payload::new(vec![vec![42]]));

        avail.push_block(&ctx, signed(&setup, original.clone())).await.unwrap();
        avail.push_block(&ctx, signed(&setup, conflicting)).await.unwrap();

        let kept = avail.block(&ctx, &lane, 0).await.unwrap();
        assert_eq!(kept.msg.block, original);
    }

    #[tokio::test]
    async fn test_lane_qc_forms_at_quorum_once() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();
        let block = setup.blocks(1, 0, Hash::ZERO, 1).remove(0);
        let vote = LaneVote { header: block.header.clone() };

        // Lane quorum for N = 4 is f + 1 = 2.
        let first = avail.push_vote(&ctx, Signed::new(vote.clone(), &setup.keys[0])).await.unwrap();
        assert!(first.is_none());
        let dup = avail.push_vote(&ctx, Signed::new(vote.clone(), &setup.keys[0])).await.unwrap();
        assert!(dup.is_none());
        let qc = avail.push_vote(&ctx, Signed::new(vote.clone(), &setup.keys[1])).await.unwrap().unwrap();
        assert_eq!(qc.verify(&setup.committee), Ok(()));
        let third = avail.push_vote(&ctx, Signed::new(vote, &setup.keys[2])).await.unwrap();
        assert!(third.is_none());

        let qcs = avail.wait_for_lane_qcs(&ctx, None).await.unwrap();
        assert_eq!(qcs.len(), 1);
        assert_eq!(qcs[&setup.keys[1].pubkey()].header(), &block.header);
    }

    #[tokio::test]
    async fn test_commit_qcs_arrive_in_order() {
        let setup = Setup::new(4);
        let avail = Arc::new(state(&setup, 0, 8));
        let ctx = Ctx::new();

        let p0 = setup.proposal(View::new(0, 0), None, &[]);
        let qc0 = setup.commit_qc(View::new(0, 0), &p0);
        let p1 = setup.proposal(View::new(1, 0), Some(&qc0), &[]);
        let qc1 = setup.commit_qc(View::new(1, 0), &p1);

        let pending = {
            let avail = avail.clone();
            let ctx = ctx.clone();
            let qc1 = qc1.clone();
            tokio::spawn(async move { avail.push_commit_qc(&ctx, qc1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(avail.latest_commit_qc().is_none(), "index 1 must wait for index 0");

        avail.push_commit_qc(&ctx, qc0.clone()).await.unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(avail.latest_commit_qc(), Some(qc1));

        // Duplicates are idempotent.
        avail.push_commit_qc(&ctx, qc0).await.unwrap();
        assert_eq!(avail.commit_qc_window(), (0, 2));
    }

    #[tokio::test]
    async fn test_canceled_push_leaves_no_trace() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();
        let p0 = setup.proposal(View::new(0, 0), None, &[]);
        let qc0 = setup.commit_qc(View::new(0, 0), &p0);
        let p1 = setup.proposal(View::new(1, 0), Some(&qc0), &[]);
        let qc1 = setup.commit_qc(View::new(1, 0), &p1);

        let child = ctx.child_token();
        child.cancel();
        assert!(avail.push_commit_qc(&child, qc1).await.unwrap_err().is_canceled());
        assert_eq!(avail.commit_qc_window(), (0, 0));
    }

    #[tokio::test]
    async fn test_app_qc_index_must_match_commit_qc() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let blocks = vec![setup.blocks(0, 0, Hash::ZERO, 2)];
        let p0 = setup.proposal(View::new(0, 0), None, &blocks);
        let qc0 = setup.commit_qc(View::new(0, 0), &p0);
        let p1 = setup.proposal(View::new(1, 0), Some(&qc0), &[]);
        let qc1 = setup.commit_qc(View::new(1, 0), &p1);

        let app = AppProposal { global_number: 1, road_index: 0, app_hash: Hash([1; 32]) };
        let app_qc = setup.app_qc(&app);
        let err = avail.prune(&app_qc, &qc1).unwrap_err();
        assert!(matches!(err, Error::Verify(VerifyError::IndexMismatch { .. })));
        assert!(avail.latest_app_qc().is_none());
    }

    #[tokio::test]
    async fn test_app_votes_prune_history() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();
        let lane = setup.keys[0].pubkey();

        // Index 0 finalizes blocks 0..2 of lane 0, index 1 finalizes 2..3.
        let blocks = setup.blocks(0, 0, Hash::ZERO, 3);
        for b in &blocks {
            avail.push_block(&ctx, signed(&setup, b.clone())).await.unwrap();
        }
        let p0 = setup.proposal(View::new(0, 0), None, &[blocks[..2].to_vec()]);
        let qc0 = setup.commit_qc(View::new(0, 0), &p0);
        let p1 = setup.proposal(View::new(1, 0), Some(&qc0), &[blocks[2..].to_vec()]);
        let qc1 = setup.commit_qc(View::new(1, 0), &p1);
        avail.push_commit_qc(&ctx, qc0).await.unwrap();
        avail.push_commit_qc(&ctx, qc1).await.unwrap();

        let app = AppProposal { global_number: 2, road_index: 1, app_hash: Hash([3; 32]) };
        let mut formed = None;
        for key in &setup.keys {
            let vote = Signed::new(AppVote { proposal: app.clone() }, key);
            if let Some(qc) = avail.push_app_vote(&ctx, vote).await.unwrap() {
                formed = Some(qc);
            }
        }
        let app_qc = formed.expect("app quorum reached");
        assert_eq!(app_qc.road_index(), 1);
        assert_eq!(avail.latest_app_qc(), Some(app_qc));

        // Index 0 and the blocks it finalized are gone, index 1 stays.
        assert!(avail.commit_qc(&ctx, 0).await.unwrap_err().is_pruned());
        assert_eq!(avail.commit_qc(&ctx, 1).await.unwrap().index(), 1);
        assert!(avail.block(&ctx, &lane, 1).await.unwrap_err().is_pruned());
        assert_eq!(avail.block(&ctx, &lane, 2).await.unwrap().msg.block, blocks[2]);
        assert_eq!(avail.next_block(&ctx, &lane, 0).await.unwrap().msg.block, blocks[2]);
    }

    #[tokio::test]
    async fn test_own_lane_resumes_after_prune_jump() {
        // Arrange: replica 0 has lost its own lane while the committee
        // finalized blocks 0..3 of it across indices 0 and 1.
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();
        let blocks = setup.blocks(0, 0, Hash::ZERO, 3);
        let p0 = setup.proposal(View::new(0, 0), None, &[blocks[..2].to_vec()]);
        let qc0 = setup.commit_qc(View::new(0, 0), &p0);
        let p1 = setup.proposal(View::new(1, 0), Some(&qc0), &[blocks[2..].to_vec()]);
        let qc1 = setup.commit_qc(View::new(1, 0), &p1);
        let app = AppProposal { global_number: 2, road_index: 1, app_hash: Hash([4; 32]) };

        // Act
        avail.prune(&setup.app_qc(&app), &qc1).unwrap();
        let produced = avail.produce_block(&ctx, Payload::new(vec![b"next".to_vec()])).await.unwrap();

        // Assert: production continues right after the finalized range.
        let header = &produced.msg.block.header;
        assert_eq!(header.block_number, 3);
        assert_eq!(header.parent_hash, blocks[2].hash());
        assert_eq!(avail.latest_commit_qc(), Some(qc1));
    }

    #[tokio::test]
    async fn test_stale_app_vote_from_same_signer_ignored() {
        let setup = Setup::new(4);
        let avail = state(&setup, 0, 8);
        let ctx = Ctx::new();
        let blocks = setup.blocks(0, 0, Hash::ZERO, 3);
        let p0 = setup.proposal(View::new(0, 0), None, &[blocks]);
        avail.push_commit_qc(&ctx, setup.commit_qc(View::new(0, 0), &p0)).await.unwrap();

        let newer = AppProposal { global_number: 2, road_index: 0, app_hash: Hash([2; 32]) };
        let older = AppProposal { global_number: 1, road_index: 0, app_hash: Hash([1; 32]) };
        for key in &setup.keys[..2] {
            avail.push_app_vote(&ctx, Signed::new(AppVote { proposal: newer.clone() }, key)).await.unwrap();
        }
        // The same two signers going backwards do not count.
        for key in &setup.keys[..2] {
            avail.push_app_vote(&ctx, Signed::new(AppVote { proposal: older.clone() }, key)).await.unwrap();
        }
        let qc = avail
            .push_app_vote(&ctx, Signed::new(AppVote { proposal: newer.clone() }, &setup.keys[2]))
            .await
            .unwrap();
        assert_eq!(qc.map(|qc| qc.global_number()), Some(2));
    }
}
