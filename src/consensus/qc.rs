use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::committee::Committee;
use super::message::{
    AppProposal, AppVote, BlockHeader, BlockNumber, CommitVote, GlobalBlockNumber, GlobalRange, LaneId, LaneRange,
    LaneVote, LeaderProposal, PrepareVote, Proposal, RoadIndex, Signed, TimeoutVote, View,
};
use crate::common::crypto::{Hash, Hashable, Signable, Signature};
use crate::common::VerifyError;

/*
    A Quorum Certificate (QC) combines a collection of signatures for the
    same message signed by a quorum of distinct committee members. Lane,
    prepare, commit and app certificates sign one shared message. Timeout
    votes may differ in the prepare QC they cite, so a timeout certificate
    keeps each signed vote and forwards the highest cited prepare QC.
*/

/// Checks that `sigs` are valid signatures over `digest` from at least
/// `quorum` distinct committee members.
pub fn verify_signatures(
    committee: &Committee,
    digest: &Hash,
    sigs: &[Signature],
    quorum: usize,
) -> Result<(), VerifyError> {
    let mut seen = HashSet::new();
    for sig in sigs {
        if !committee.is_member(&sig.signer) {
            return Err(VerifyError::NotMember(sig.signer));
        }
        if !seen.insert(sig.signer) {
            return Err(VerifyError::DuplicateSigner(sig.signer));
        }
        if !sig.verify(digest) {
            return Err(VerifyError::BadSignature(sig.signer));
        }
    }
    if seen.len() < quorum {
        return Err(VerifyError::InsufficientQuorum {
            got: seen.len(),
            need: quorum,
        });
    }
    Ok(())
}

fn collect<M: Signable + Clone>(votes: &[Signed<M>]) -> Option<(M, Vec<Signature>)> {
    let msg = votes.first()?.msg.clone();
    Some((msg, votes.iter().map(|v| v.sig.clone()).collect()))
}

/// Certifies that a lane block and all its lane ancestors are available.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LaneQc {
    pub vote: LaneVote,
    pub sigs: Vec<Signature>,
}

impl LaneQc {
    /// Builds a QC from votes that all sign the same header.
    pub fn from_votes(votes: &[Signed<LaneVote>]) -> Option<Self> {
        collect(votes).map(|(vote, sigs)| LaneQc { vote, sigs })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.vote.header
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        self.vote.header.verify(committee)?;
        verify_signatures(committee, &self.vote.signing_digest(), &self.sigs, committee.quorums().lane)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PrepareQc {
    pub vote: PrepareVote,
    pub sigs: Vec<Signature>,
}

impl PrepareQc {
    pub fn from_votes(votes: &[Signed<PrepareVote>]) -> Option<Self> {
        collect(votes).map(|(vote, sigs)| PrepareQc { vote, sigs })
    }

    pub fn view(&self) -> View {
        self.vote.view
    }

    pub fn proposal(&self) -> &Proposal {
        &self.vote.proposal
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        self.vote.proposal.verify_shape(committee)?;
        verify_signatures(committee, &self.vote.signing_digest(), &self.sigs, committee.quorums().prepare)
    }
}

/// The finality certificate for one road index.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CommitQc {
    pub vote: CommitVote,
    pub sigs: Vec<Signature>,
}

impl CommitQc {
    pub fn from_votes(votes: &[Signed<CommitVote>]) -> Option<Self> {
        collect(votes).map(|(vote, sigs)| CommitQc { vote, sigs })
    }

    pub fn index(&self) -> RoadIndex {
        self.vote.view.index
    }

    pub fn view(&self) -> View {
        self.vote.view
    }

    pub fn proposal(&self) -> &Proposal {
        &self.vote.proposal
    }

    pub fn global_range(&self) -> GlobalRange {
        self.vote.proposal.global_range()
    }

    pub fn lane_range(&self, lane: &LaneId) -> Option<&LaneRange> {
        self.vote.proposal.lane_range(lane)
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        self.vote.proposal.verify_shape(committee)?;
        verify_signatures(committee, &self.vote.signing_digest(), &self.sigs, committee.quorums().commit)
    }
}

impl Hashable for CommitQc {
    fn hash(&self) -> Hash {
        self.vote.hash()
    }
}

/// Road index after `qc`; 0 before the first commit.
pub fn next_index(qc: Option<&CommitQc>) -> RoadIndex {
    qc.map_or(0, |qc| qc.index() + 1)
}

/// First global block number not finalized by `qc`.
pub fn next_global(qc: Option<&CommitQc>) -> GlobalBlockNumber {
    qc.map_or(0, |qc| qc.global_range().next)
}

/// Where `lane`'s next range has to start after `qc`: the first unfinalized
/// block number and the hash of the block before it.
pub fn lane_start(qc: Option<&CommitQc>, lane: &LaneId) -> (BlockNumber, Hash) {
    match qc.and_then(|qc| qc.lane_range(lane)) {
        Some(range) => (range.next, range.last_hash),
        None => (0, Hash::ZERO),
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AppQc {
    pub vote: AppVote,
    pub sigs: Vec<Signature>,
}

impl AppQc {
    pub fn from_votes(votes: &[Signed<AppVote>]) -> Option<Self> {
        collect(votes).map(|(vote, sigs)| AppQc { vote, sigs })
    }

    pub fn proposal(&self) -> &AppProposal {
        &self.vote.proposal
    }

    pub fn road_index(&self) -> RoadIndex {
        self.vote.proposal.road_index
    }

    pub fn global_number(&self) -> GlobalBlockNumber {
        self.vote.proposal.global_number
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        verify_signatures(committee, &self.vote.signing_digest(), &self.sigs, committee.quorums().app)
    }
}

/// A timeout vote plus the prepare QC backing its `high_prepare_view`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FullTimeoutVote {
    pub vote: Signed<TimeoutVote>,
    pub high_qc: Option<PrepareQc>,
}

impl FullTimeoutVote {
    pub fn view(&self) -> View {
        self.vote.msg.view
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        self.vote.verify(committee)?;
        verify_high_qc(committee, self.vote.msg.view, self.vote.msg.high_prepare_view, self.high_qc.as_ref())
    }
}

fn verify_high_qc(
    committee: &Committee,
    view: View,
    cited: Option<View>,
    high_qc: Option<&PrepareQc>,
) -> Result<(), VerifyError> {
    match (cited, high_qc) {
        (None, None) => Ok(()),
        (Some(cited), Some(qc)) => {
            if qc.view() != cited {
                return Err(VerifyError::ViewMismatch {
                    expected: cited,
                    got: qc.view(),
                });
            }
            if cited.index != view.index || cited > view {
                return Err(VerifyError::BadJustification(format!(
                    "prepare QC for {cited:?} cited in timeout for {view:?}"
                )));
            }
            qc.verify(committee)
        }
        _ => Err(VerifyError::BadJustification("cited prepare QC missing or unexpected".into())),
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TimeoutQc {
    pub view: View,
    pub votes: Vec<Signed<TimeoutVote>>,
    /// The prepare QC with the highest view cited by any vote.
    pub high_qc: Option<PrepareQc>,
}

impl TimeoutQc {
    /// Builds a QC from full votes that all time out `view`.
    pub fn from_votes(view: View, votes: &[FullTimeoutVote]) -> Self {
        let high_qc = votes
            .iter()
            .filter_map(|v| v.high_qc.as_ref())
            .max_by_key(|qc| qc.view())
            .cloned();
        TimeoutQc {
            view,
            votes: votes.iter().map(|v| v.vote.clone()).collect(),
            high_qc,
        }
    }

    pub fn index(&self) -> RoadIndex {
        self.view.index
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        let mut seen = HashSet::new();
        for vote in &self.votes {
            if vote.msg.view != self.view {
                return Err(VerifyError::ViewMismatch {
                    expected: self.view,
                    got: vote.msg.view,
                });
            }
            if !seen.insert(*vote.signer()) {
                return Err(VerifyError::DuplicateSigner(*vote.signer()));
            }
            vote.verify(committee)?;
        }
        if seen.len() < committee.quorums().timeout {
            return Err(VerifyError::InsufficientQuorum {
                got: seen.len(),
                need: committee.quorums().timeout,
            });
        }
        let cited = self.votes.iter().filter_map(|v| v.msg.high_prepare_view).max();
        verify_high_qc(committee, self.view, cited, self.high_qc.as_ref())
    }
}

/// The minimal justification for the current view: the last commit QC and,
/// if views at the next index have timed out, the latest timeout QC.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ViewSpec {
    pub commit_qc: Option<CommitQc>,
    pub timeout_qc: Option<TimeoutQc>,
}

impl ViewSpec {
    pub fn view(&self) -> View {
        match &self.timeout_qc {
            Some(tqc) => View::new(tqc.view.index, tqc.view.number + 1),
            None => View::new(next_index(self.commit_qc.as_ref()), 0),
        }
    }

    /// The prepare QC a leader of this view has to repropose, if any.
    pub fn reproposal(&self) -> Option<&PrepareQc> {
        self.timeout_qc.as_ref().and_then(|tqc| tqc.high_qc.as_ref())
    }

    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        if let Some(qc) = &self.commit_qc {
            qc.verify(committee)?;
        }
        if let Some(tqc) = &self.timeout_qc {
            let expected = next_index(self.commit_qc.as_ref());
            if tqc.index() != expected {
                return Err(VerifyError::IndexMismatch {
                    expected,
                    got: tqc.index(),
                });
            }
            tqc.verify(committee)?;
        }
        Ok(())
    }
}

/// A leader's proposal with everything needed to check it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FullProposal {
    pub proposal: Signed<LeaderProposal>,
    pub lane_qcs: Vec<LaneQc>,
    pub app_qc: Option<AppQc>,
    pub timeout_qc: Option<TimeoutQc>,
}

impl FullProposal {
    pub fn view(&self) -> View {
        self.proposal.msg.view
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal.msg.proposal
    }

    /// Checks the proposal against the locally known justification `spec`.
    pub fn verify(&self, committee: &Committee, spec: &ViewSpec) -> Result<(), VerifyError> {
        let view = self.view();
        let expected = spec.view();
        if view != expected {
            return Err(VerifyError::ViewMismatch { expected, got: view });
        }
        let leader = committee.leader(view);
        if self.proposal.signer() != &leader {
            return Err(VerifyError::WrongLeader {
                view,
                signer: *self.proposal.signer(),
                leader,
            });
        }
        self.proposal.verify(committee)?;
        self.verify_timeout_qc(committee, spec)?;

        let reproposal = self.timeout_qc.as_ref().and_then(|tqc| tqc.high_qc.as_ref());
        match reproposal {
            Some(high_qc) => self.verify_reproposal(high_qc),
            None => {
                self.verify_lane_ranges(committee, spec)?;
                self.verify_app(committee, spec)
            }
        }
    }

    fn verify_timeout_qc(&self, committee: &Committee, spec: &ViewSpec) -> Result<(), VerifyError> {
        match (&self.timeout_qc, &spec.timeout_qc) {
            (None, None) => Ok(()),
            (Some(tqc), Some(_)) => {
                let view = self.view();
                let justified = View::new(view.index, view.number.wrapping_sub(1));
                if view.number == 0 || tqc.view != justified {
                    return Err(VerifyError::ViewMismatch {
                        expected: justified,
                        got: tqc.view,
                    });
                }
                tqc.verify(committee)
            }
            (None, Some(_)) => Err(VerifyError::BadJustification("missing timeout QC".into())),
            (Some(_), None) => Err(VerifyError::BadJustification("unexpected timeout QC".into())),
        }
    }

    fn verify_reproposal(&self, high_qc: &PrepareQc) -> Result<(), VerifyError> {
        if self.proposal().hash() != high_qc.proposal().hash() {
            return Err(VerifyError::BadReproposal);
        }
        if !self.lane_qcs.is_empty() || self.app_qc.is_some() {
            return Err(VerifyError::BadJustification("reproposal carries lane or app QCs".into()));
        }
        Ok(())
    }

    fn verify_lane_ranges(&self, committee: &Committee, spec: &ViewSpec) -> Result<(), VerifyError> {
        let proposal = self.proposal();
        if proposal.view != self.view() {
            return Err(VerifyError::ViewMismatch {
                expected: self.view(),
                got: proposal.view,
            });
        }
        proposal.verify_shape(committee)?;

        let mut used = 0;
        for range in &proposal.lane_ranges {
            let (first, prev_hash) = lane_start(spec.commit_qc.as_ref(), &range.lane);
            if range.first != first {
                return Err(VerifyError::BadRange(format!(
                    "lane {:?} starts at {}, expected {}",
                    range.lane, range.first, first
                )));
            }
            if range.is_empty() {
                if range.last_hash != prev_hash {
                    return Err(VerifyError::BadRange(format!("empty lane {:?} changes last hash", range.lane)));
                }
                continue;
            }
            let qc = self
                .lane_qcs
                .iter()
                .find(|qc| qc.header().lane == range.lane)
                .ok_or_else(|| VerifyError::BadRange(format!("no lane QC for lane {:?}", range.lane)))?;
            if qc.header().block_number + 1 != range.next || qc.header().hash() != range.last_hash {
                return Err(VerifyError::BadRange(format!(
                    "lane QC for {:?} does not match range end",
                    range.lane
                )));
            }
            qc.verify(committee)?;
            used += 1;
        }
        if used != self.lane_qcs.len() {
            return Err(VerifyError::BadJustification("unused lane QCs".into()));
        }
        Ok(())
    }

    /// Once an app proposal is finalized every later proposal carries it,
    /// or a newer one certified by an app QC, so the finalized app state
    /// can be read off any single commit QC.
    fn verify_app(&self, committee: &Committee, spec: &ViewSpec) -> Result<(), VerifyError> {
        let prev = spec.commit_qc.as_ref().and_then(|qc| qc.proposal().app.as_ref());
        let app = match (&self.proposal().app, prev) {
            (None, None) => None,
            (None, Some(prev)) => {
                return Err(VerifyError::BadAppProposal(format!(
                    "app proposal {} dropped",
                    prev.global_number
                )))
            }
            (Some(app), Some(prev)) if app == prev => None,
            (Some(app), Some(prev)) if app.global_number <= prev.global_number => {
                return Err(VerifyError::BadAppProposal(format!(
                    "app proposal {} does not advance past {}",
                    app.global_number, prev.global_number
                )))
            }
            (Some(app), _) => Some(app),
        };
        let Some(app) = app else {
            if self.app_qc.is_some() {
                return Err(VerifyError::BadAppProposal("app QC without a new app proposal".into()));
            }
            return Ok(());
        };
        let finalized = next_global(spec.commit_qc.as_ref());
        if app.global_number >= finalized {
            return Err(VerifyError::BadAppProposal(format!(
                "app proposal {} beyond finalized {}",
                app.global_number, finalized
            )));
        }
        let qc = self
            .app_qc
            .as_ref()
            .ok_or_else(|| VerifyError::BadAppProposal("missing app QC".into()))?;
        if qc.proposal() != app {
            return Err(VerifyError::BadAppProposal("app QC certifies a different proposal".into()));
        }
        qc.verify(committee)
    }
}

/// A commit QC with the headers of every block it finalizes, in global
/// order.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FullCommitQc {
    pub qc: CommitQc,
    pub headers: Vec<BlockHeader>,
}

impl FullCommitQc {
    pub fn verify(&self, committee: &Committee) -> Result<(), VerifyError> {
        self.qc.verify(committee)?;
        let range = self.qc.global_range();
        if self.headers.len() as u64 != range.len() {
            return Err(VerifyError::HashMismatch(format!(
                "{} headers for a range of {}",
                self.headers.len(),
                range.len()
            )));
        }
        let mut headers = self.headers.iter();
        for lane in &self.qc.proposal().lane_ranges {
            let mut prev: Option<Hash> = None;
            for n in lane.first..lane.next {
                let header = headers
                    .next()
                    .ok_or_else(|| VerifyError::HashMismatch("missing header".into()))?;
                if header.lane != lane.lane || header.block_number != n {
                    return Err(VerifyError::HashMismatch(format!(
                        "header {:?}/{} where {:?}/{} expected",
                        header.lane, header.block_number, lane.lane, n
                    )));
                }
                if let Some(prev) = prev {
                    if header.parent_hash != prev {
                        return Err(VerifyError::HashMismatch(format!("broken chain at {:?}/{}", lane.lane, n)));
                    }
                }
                prev = Some(header.hash());
            }
            if let Some(last) = prev {
                if last != lane.last_hash {
                    return Err(VerifyError::HashMismatch(format!("lane {:?} ends at the wrong block", lane.lane)));
                }
            }
        }
        Ok(())
    }

    /// Headers paired with their global block numbers.
    pub fn numbered(&self) -> impl Iterator<Item = (GlobalBlockNumber, &BlockHeader)> {
        let first = self.qc.global_range().first;
        self.headers.iter().enumerate().map(move |(i, h)| (first + i as u64, h))
    }
}
