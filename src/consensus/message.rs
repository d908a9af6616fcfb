use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};

use super::committee::Committee;
use crate::common::crypto::{Hash, Hashable, Keypair, PublicKey, Signable, Signature};
use crate::common::VerifyError;

/*
    Every replica runs its own lane: a hash-linked chain of blocks it alone
    produces. A block is available once f + 1 replicas have voted for its
    header, since then at least one correct replica can serve it.

    Consensus does not order blocks one by one. Each road index agrees on a
    proposal that names, for every lane, a range of block numbers extending
    the ranges finalized at the previous index, plus optionally the app hash
    the committee certified after executing some prefix of the global order.
    Within a road index the protocol runs in views; a view that times out
    hands over to the next one, carrying any proposal that may already have
    been committed.
*/

pub type LaneId = PublicKey;
pub type BlockNumber = u64;
pub type GlobalBlockNumber = u64;
pub type RoadIndex = u64;
pub type ViewNumber = u64;

/// One attempt at finalizing a road index. Ordered by index, then number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
pub struct View {
    pub index: RoadIndex,
    pub number: ViewNumber,
}

impl View {
    pub fn new(index: RoadIndex, number: ViewNumber) -> Self {
        View { index, number }
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(self.index.to_be_bytes());
        hasher.update(self.number.to_be_bytes());
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Payload {
    pub created_at_ms: u64,
    pub gas_used: u64,
    pub base_fee: u64,
    pub txs: Vec<Vec<u8>>,
}

impl Payload {
    pub fn new(txs: Vec<Vec<u8>>) -> Self {
        Payload {
            created_at_ms: now_ms(),
            gas_used: 0,
            base_fee: 0,
            txs,
        }
    }
}

impl Hashable for Payload {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.created_at_ms.to_be_bytes());
        hasher.update(self.gas_used.to_be_bytes());
        hasher.update(self.base_fee.to_be_bytes());
        hasher.update((self.txs.len() as u64).to_be_bytes());
        for tx in &self.txs {
            hasher.update((tx.len() as u64).to_be_bytes());
            hasher.update(tx);
        }
        Hash::finish(hasher)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub lane: LaneId,
    pub block_number: BlockNumber,
    pub parent_hash: Hash,
    pub payload_hash: Hash,
}

impl BlockHeader {
    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        if !committee.is_member(&self.lane) {
            return Err(VerifyError::NotMember(self.lane));
        }
        Ok(())
    }
}

impl Hashable for BlockHeader {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.lane.as_ref());
        hasher.update(self.block_number.to_be_bytes());
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.payload_hash.as_bytes());
        Hash::finish(hasher)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Payload,
}

impl Block {
    pub fn new(lane: LaneId, block_number: BlockNumber, parent_hash: Hash, payload: Payload) -> Self {
        Block {
            header: BlockHeader {
                lane,
                block_number,
                parent_hash,
                payload_hash: payload.hash(),
            },
            payload,
        }
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        self.header.verify(committee)?;
        if self.header.payload_hash != self.payload.hash() {
            return Err(VerifyError::HashMismatch("payload does not match header".into()));
        }
        Ok(())
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash {
        self.header.hash()
    }
}

/// A block as announced by its producer.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LaneProposal {
    pub block: Block,
}

impl Hashable for LaneProposal {
    fn hash(&self) -> Hash {
        self.block.hash()
    }
}

impl Signable for LaneProposal {
    const TAG: &'static [u8] = b"autobahn/lane-proposal";
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LaneVote {
    pub header: BlockHeader,
}

impl Hashable for LaneVote {
    fn hash(&self) -> Hash {
        self.header.hash()
    }
}

impl Signable for LaneVote {
    const TAG: &'static [u8] = b"autobahn/lane-vote";
}

/// A message together with its author's signature.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Signed<M> {
    pub msg: M,
    pub sig: Signature,
}

impl<M: Signable> Signed<M> {
    pub fn new(msg: M, keypair: &Keypair) -> Self {
        let sig = keypair.sign(&msg.signing_digest());
        Signed { msg, sig }
    }

    pub fn signer(&self) -> &PublicKey {
        &self.sig.signer
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        if !committee.is_member(&self.sig.signer) {
            return Err(VerifyError::NotMember(self.sig.signer));
        }
        if !self.sig.verify(&self.msg.signing_digest()) {
            return Err(VerifyError::BadSignature(self.sig.signer));
        }
        Ok(())
    }
}

/// Half-open range `[first, next)` of one lane's block numbers.
///
/// `last_hash` is the hash of block `next - 1`, or the zero hash if the lane
/// has no blocks below `next`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LaneRange {
    pub lane: LaneId,
    pub first: BlockNumber,
    pub next: BlockNumber,
    pub last_hash: Hash,
}

impl LaneRange {
    /// The empty range a lane starts from.
    pub fn genesis(lane: LaneId) -> Self {
        LaneRange {
            lane,
            first: 0,
            next: 0,
            last_hash: Hash::ZERO,
        }
    }

    pub fn len(&self) -> u64 {
        self.next.saturating_sub(self.first)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(self.lane.as_ref());
        hasher.update(self.first.to_be_bytes());
        hasher.update(self.next.to_be_bytes());
        hasher.update(self.last_hash.as_bytes());
    }
}

/// Half-open window of global block numbers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct GlobalRange {
    pub first: GlobalBlockNumber,
    pub next: GlobalBlockNumber,
}

impl GlobalRange {
    pub fn len(&self) -> u64 {
        self.next - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.next
    }

    pub fn contains(&self, n: GlobalBlockNumber) -> bool {
        n >= self.first && n < self.next
    }
}

/// Claim that executing the global order up to and including
/// `global_number` yields `app_hash`. `road_index` is the commit QC whose
/// range holds `global_number`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AppProposal {
    pub global_number: GlobalBlockNumber,
    pub road_index: RoadIndex,
    pub app_hash: Hash,
}

impl AppProposal {
    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(self.global_number.to_be_bytes());
        hasher.update(self.road_index.to_be_bytes());
        hasher.update(self.app_hash.as_bytes());
    }
}

impl Hashable for AppProposal {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        Hash::finish(hasher)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AppVote {
    pub proposal: AppProposal,
}

impl Hashable for AppVote {
    fn hash(&self) -> Hash {
        self.proposal.hash()
    }
}

impl Signable for AppVote {
    const TAG: &'static [u8] = b"autobahn/app-vote";
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Proposal {
    /// The view this proposal was first made in. A reproposal keeps it.
    pub view: View,
    pub created_at_ms: u64,
    /// One range per committee member, in committee order.
    pub lane_ranges: Vec<LaneRange>,
    pub app: Option<AppProposal>,
}

impl Proposal {
    pub fn index(&self) -> RoadIndex {
        self.view.index
    }

    pub fn lane_range(&self, lane: &LaneId) -> Option<&LaneRange> {
        self.lane_ranges.iter().find(|r| &r.lane == lane)
    }

    /// Lane ranges are contiguous from genesis, so the blocks finalized
    /// before this proposal number exactly `Σ first`.
    pub fn global_range(&self) -> GlobalRange {
        GlobalRange {
            first: self.lane_ranges.iter().map(|r| r.first).sum(),
            next: self.lane_ranges.iter().map(|r| r.next).sum(),
        }
    }

    /// Lane and block number of every block this proposal finalizes, in
    /// global order.
    pub fn blocks(&self) -> impl Iterator<Item = (LaneId, BlockNumber)> + '_ {
        self.lane_ranges
            .iter()
            .flat_map(|r| (r.first..r.next).map(move |n| (r.lane, n)))
    }

    /// Checks that there is exactly one well-formed range per member.
    pub fn verify_shape(&self, committee: &Committee) -> Result<(), VerifyError> {
        if self.lane_ranges.len() != committee.n() {
            return Err(VerifyError::BadRange(format!(
                "{} lane ranges for {} lanes",
                self.lane_ranges.len(),
                committee.n()
            )));
        }
        for (range, lane) in self.lane_ranges.iter().zip(committee.replicas()) {
            if &range.lane != lane {
                return Err(VerifyError::BadRange(format!("range for {:?} out of order", range.lane)));
            }
            if range.first > range.next {
                return Err(VerifyError::BadRange(format!(
                    "lane {:?}: first {} > next {}",
                    range.lane, range.first, range.next
                )));
            }
        }
        if let Some(app) = &self.app {
            if app.road_index >= self.index() {
                return Err(VerifyError::BadAppProposal(format!(
                    "app proposal for index {} in proposal for index {}",
                    app.road_index,
                    self.index()
                )));
            }
        }
        Ok(())
    }
}

impl Hashable for Proposal {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.view.hash_into(&mut hasher);
        hasher.update(self.created_at_ms.to_be_bytes());
        hasher.update((self.lane_ranges.len() as u64).to_be_bytes());
        for range in &self.lane_ranges {
            range.hash_into(&mut hasher);
        }
        match &self.app {
            Some(app) => {
                hasher.update([1u8]);
                app.hash_into(&mut hasher);
            }
            None => hasher.update([0u8]),
        }
        Hash::finish(hasher)
    }
}

/// What the leader signs: a proposal put forward in `view`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LeaderProposal {
    pub view: View,
    pub proposal: Proposal,
}

impl Hashable for LeaderProposal {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.view.hash_into(&mut hasher);
        hasher.update(self.proposal.hash().as_bytes());
        Hash::finish(hasher)
    }
}

impl Signable for LeaderProposal {
    const TAG: &'static [u8] = b"autobahn/leader-proposal";
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PrepareVote {
    pub view: View,
    pub proposal: Proposal,
}

impl Hashable for PrepareVote {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.view.hash_into(&mut hasher);
        hasher.update(self.proposal.hash().as_bytes());
        Hash::finish(hasher)
    }
}

impl Signable for PrepareVote {
    const TAG: &'static [u8] = b"autobahn/prepare-vote";
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CommitVote {
    pub view: View,
    pub proposal: Proposal,
}

impl Hashable for CommitVote {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.view.hash_into(&mut hasher);
        hasher.update(self.proposal.hash().as_bytes());
        Hash::finish(hasher)
    }
}

impl Signable for CommitVote {
    const TAG: &'static [u8] = b"autobahn/commit-vote";
}

/// A vote to leave `view`, naming the view of the highest prepare QC the
/// voter has seen at this road index.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TimeoutVote {
    pub view: View,
    pub high_prepare_view: Option<View>,
}

impl Hashable for TimeoutVote {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.view.hash_into(&mut hasher);
        match &self.high_prepare_view {
            Some(v) => {
                hasher.update([1u8]);
                v.hash_into(&mut hasher);
            }
            None => hasher.update([0u8]),
        }
        Hash::finish(hasher)
    }
}

impl Signable for TimeoutVote {
    const TAG: &'static [u8] = b"autobahn/timeout-vote";
}
