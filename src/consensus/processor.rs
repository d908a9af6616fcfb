use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::availability::AvailabilityState;
use super::committee::Committee;
use super::message::{
    now_ms, CommitVote, LaneRange, LeaderProposal, PrepareVote, Proposal, Signed, TimeoutVote, View,
};
use super::persist::Persister;
use super::qc::{
    lane_start, next_global, next_index, CommitQc, FullProposal, FullTimeoutVote, PrepareQc, TimeoutQc, ViewSpec,
};
use crate::common::crypto::{Hash, Hashable, Keypair, PublicKey};
use crate::common::{Ctx, Error, Guarded, Result, VerifyError};
use crate::config::ViewTimeout;

/*
    Each road index is decided in one or more views. In a view the leader
    broadcasts a proposal, replicas answer with prepare votes, N - f
    prepare votes make a prepare QC, on which replicas cast commit votes,
    and N - f commit votes make the commit QC that closes the index.

    A replica that sits in a view for too long votes to time it out. A
    timeout vote carries the highest prepare QC the replica saw at this
    index, and N - f of them make a timeout QC that opens the next view.
    If any commit QC could have formed in the old view, at least one
    correct replica in the timeout QC holds its prepare QC, so the next
    leader is told to repropose exactly that proposal.

    Votes are only ever sent after the record that contains them is on
    disk, so a replica that restarts mid-view never votes differently.
*/

const RECORD_NAME: &str = "inner";

/// The part of the consensus state that survives restarts. Every vote
/// and certificate in it belongs to the view implied by `commit_qc` and
/// `timeout_qc`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedInner {
    pub commit_qc: Option<CommitQc>,
    pub prepare_qc: Option<PrepareQc>,
    pub timeout_qc: Option<TimeoutQc>,
    pub prepare_vote: Option<Signed<PrepareVote>>,
    pub commit_vote: Option<Signed<CommitVote>>,
    pub timeout_vote: Option<FullTimeoutVote>,
}

impl PersistedInner {
    pub fn view_spec(&self) -> ViewSpec {
        ViewSpec {
            commit_qc: self.commit_qc.clone(),
            timeout_qc: self.timeout_qc.clone(),
        }
    }

    pub fn view(&self) -> View {
        match &self.timeout_qc {
            Some(tqc) => View::new(tqc.view.index, tqc.view.number + 1),
            None => View::new(next_index(self.commit_qc.as_ref()), 0),
        }
    }

    /// Rejects any record that could not have been written by `me`.
    pub fn validate(&self, committee: &Committee, me: &PublicKey) -> Result<()> {
        self.check(committee, me)
            .map_err(|e| Error::Corrupt(format!("consensus record: {e}")))
    }

    fn check(&self, committee: &Committee, me: &PublicKey) -> std::result::Result<(), VerifyError> {
        self.view_spec().verify(committee)?;
        let view = self.view();
        let same_view = |got: View| {
            if got == view {
                Ok(())
            } else {
                Err(VerifyError::ViewMismatch { expected: view, got })
            }
        };
        let own = |signer: &PublicKey| {
            if signer == me {
                Ok(())
            } else {
                Err(VerifyError::BadJustification(format!("vote signed by {signer:?}")))
            }
        };
        if let Some(qc) = &self.prepare_qc {
            same_view(qc.view())?;
            qc.verify(committee)?;
        }
        if let Some(vote) = &self.prepare_vote {
            same_view(vote.msg.view)?;
            own(vote.signer())?;
            vote.verify(committee)?;
        }
        if let Some(vote) = &self.commit_vote {
            if self.prepare_qc.is_none() {
                return Err(VerifyError::BadJustification("commit vote without prepare QC".into()));
            }
            same_view(vote.msg.view)?;
            own(vote.signer())?;
            vote.verify(committee)?;
        }
        if let Some(vote) = &self.timeout_vote {
            same_view(vote.view())?;
            own(vote.vote.signer())?;
            vote.verify(committee)?;
        }
        Ok(())
    }
}

/// Opens the A/B record in `dir`, returning the persister and the last
/// persisted state, if any.
pub fn open_record(dir: &Path) -> Result<(Persister<PersistedInner>, Option<PersistedInner>)> {
    Persister::open(dir, RECORD_NAME)
}

/// Messages the consensus state sends to its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMessage {
    Proposal(FullProposal),
    PrepareVote(Signed<PrepareVote>),
    CommitVote(Signed<CommitVote>),
    TimeoutVote(FullTimeoutVote),
    TimeoutQc(TimeoutQc),
}

struct State {
    inner: PersistedInner,
    /// Latest vote of each kind from each signer.
    prepare_votes: HashMap<PublicKey, Signed<PrepareVote>>,
    commit_votes: HashMap<PublicKey, Signed<CommitVote>>,
    timeout_votes: HashMap<PublicKey, FullTimeoutVote>,
    /// Last view this replica proposed in.
    proposed: Option<View>,
    /// Messages waiting for `inner` to be persisted before they go out.
    outbox: Vec<ConsensusMessage>,
    /// Bumped on every change to `inner`.
    version: u64,
}

fn quorum_of<'a, V: Clone + 'a>(
    votes: impl Iterator<Item = &'a V>,
    key: impl Fn(&V) -> Hash,
    quorum: usize,
) -> Option<Vec<V>> {
    let mut groups: HashMap<Hash, Vec<V>> = HashMap::new();
    for vote in votes {
        groups.entry(key(vote)).or_default().push(vote.clone());
    }
    groups.into_values().find(|g| g.len() >= quorum)
}

impl State {
    fn view(&self) -> View {
        self.inner.view()
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// Queues one of this replica's own messages. Own votes count towards
    /// certificates right away.
    fn cast(&mut self, me: PublicKey, msg: ConsensusMessage) {
        match &msg {
            ConsensusMessage::PrepareVote(v) => {
                self.prepare_votes.insert(me, v.clone());
            }
            ConsensusMessage::CommitVote(v) => {
                self.commit_votes.insert(me, v.clone());
            }
            ConsensusMessage::TimeoutVote(v) => {
                self.timeout_votes.insert(me, v.clone());
            }
            ConsensusMessage::Proposal(_) | ConsensusMessage::TimeoutQc(_) => {}
        }
        self.outbox.push(msg);
    }

    /// Highest prepare QC known at the current index.
    fn high_prepare_qc(&self) -> Option<PrepareQc> {
        let carried = self.inner.timeout_qc.as_ref().and_then(|t| t.high_qc.as_ref());
        [self.inner.prepare_qc.as_ref(), carried]
            .into_iter()
            .flatten()
            .max_by_key(|qc| qc.view())
            .cloned()
    }

    fn advance_commit(&mut self, qc: CommitQc) -> bool {
        if qc.index() < self.view().index {
            return false;
        }
        info!(index = qc.index(), view = ?qc.view(), "committed");
        self.inner = PersistedInner {
            commit_qc: Some(qc),
            ..Default::default()
        };
        self.touch();
        true
    }

    fn advance_timeout(&mut self, tqc: TimeoutQc) -> bool {
        let view = self.view();
        if tqc.view.index != view.index || tqc.view < view {
            return false;
        }
        info!(timed_out = ?tqc.view, reproposal = tqc.high_qc.is_some(), "view timed out");
        self.inner = PersistedInner {
            commit_qc: self.inner.commit_qc.take(),
            timeout_qc: Some(tqc),
            ..Default::default()
        };
        self.touch();
        true
    }

    /// Forms whatever certificates the collected votes allow and casts the
    /// votes they call for. Returns the commit QCs formed on the way.
    fn settle(&mut self, committee: &Committee, keypair: &Keypair) -> Vec<CommitQc> {
        let quorums = *committee.quorums();
        let mut formed = Vec::new();
        loop {
            let view = self.view();
            if self.inner.prepare_qc.is_none() {
                let votes = self.prepare_votes.values().filter(|v| v.msg.view == view);
                if let Some(qc) =
                    quorum_of(votes, |v| v.msg.proposal.hash(), quorums.prepare).and_then(|g| PrepareQc::from_votes(&g))
                {
                    debug!(?view, "prepare QC");
                    self.inner.prepare_qc = Some(qc);
                    self.touch();
                }
            }

            let pending = match (&self.inner.prepare_qc, &self.inner.commit_vote, &self.inner.timeout_vote) {
                (Some(qc), None, None) => Some(qc.proposal().clone()),
                _ => None,
            };
            if let Some(proposal) = pending {
                let vote = Signed::new(CommitVote { view, proposal }, keypair);
                self.inner.commit_vote = Some(vote.clone());
                self.cast(keypair.pubkey(), ConsensusMessage::CommitVote(vote));
                self.touch();
            }

            let votes = self.commit_votes.values().filter(|v| v.msg.view == view);
            if let Some(qc) =
                quorum_of(votes, |v| v.msg.proposal.hash(), quorums.commit).and_then(|g| CommitQc::from_votes(&g))
            {
                formed.push(qc.clone());
                self.advance_commit(qc);
                continue;
            }

            let votes: Vec<_> = self.timeout_votes.values().filter(|v| v.view() == view).cloned().collect();
            if votes.len() >= quorums.timeout {
                let tqc = TimeoutQc::from_votes(view, &votes);
                self.outbox.push(ConsensusMessage::TimeoutQc(tqc.clone()));
                self.advance_timeout(tqc);
                continue;
            }
            return formed;
        }
    }
}

pub struct ConsensusState {
    committee: Arc<Committee>,
    keypair: Arc<Keypair>,
    avail: Arc<AvailabilityState>,
    view_timeout: ViewTimeout,
    state: Guarded<State>,
    /// Taken by the output task, the only writer of the record.
    persister: Mutex<Option<Persister<PersistedInner>>>,
}

impl ConsensusState {
    /// Builds the state from the last persisted record. Votes in the record
    /// are sent again, since they may not have reached anyone before the
    /// restart.
    pub fn new(
        committee: Arc<Committee>,
        keypair: Arc<Keypair>,
        avail: Arc<AvailabilityState>,
        view_timeout: ViewTimeout,
        persister: Option<Persister<PersistedInner>>,
        recovered: Option<PersistedInner>,
    ) -> Result<Self> {
        let inner = recovered.unwrap_or_default();
        inner.validate(&committee, &keypair.pubkey())?;

        let me = keypair.pubkey();
        let mut state = State {
            inner,
            prepare_votes: HashMap::new(),
            commit_votes: HashMap::new(),
            timeout_votes: HashMap::new(),
            proposed: None,
            outbox: Vec::new(),
            version: 0,
        };
        for vote in state.inner.prepare_vote.clone() {
            state.cast(me, ConsensusMessage::PrepareVote(vote));
        }
        for vote in state.inner.commit_vote.clone() {
            state.cast(me, ConsensusMessage::CommitVote(vote));
        }
        for vote in state.inner.timeout_vote.clone() {
            state.cast(me, ConsensusMessage::TimeoutVote(vote));
        }
        if !state.outbox.is_empty() || state.inner.commit_qc.is_some() {
            info!(view = ?state.inner.view(), "resuming from persisted consensus state");
        }

        Ok(ConsensusState {
            committee,
            keypair,
            avail,
            view_timeout,
            state: Guarded::new(state),
            persister: Mutex::new(persister),
        })
    }

    pub fn view(&self) -> View {
        self.state.read(|s| s.view())
    }

    /// Snapshot of the state that would be persisted right now.
    pub fn inner(&self) -> PersistedInner {
        self.state.read(|s| s.inner.clone())
    }

    /// Blocks until the replica has reached `view` or moved past it.
    pub async fn wait_for_view(&self, ctx: &Ctx, view: View) -> Result<View> {
        self.state.wait_for(ctx, |s| (s.view() >= view).then(|| s.view())).await
    }

    async fn publish(&self, ctx: &Ctx, formed: Vec<CommitQc>) -> Result<()> {
        for qc in formed {
            self.avail.push_commit_qc(ctx, qc).await?;
        }
        Ok(())
    }

    /// Handles a leader's proposal: waits until this replica reaches the
    /// proposal's view, checks it against the local justification and
    /// casts a prepare vote.
    pub async fn push_proposal(&self, ctx: &Ctx, proposal: FullProposal) -> Result<()> {
        let view = proposal.view();
        if let Some(tqc) = &proposal.timeout_qc {
            self.push_timeout_qc(ctx, tqc.clone()).await?;
        }
        let spec = self
            .state
            .wait_for(ctx, |s| (s.view() >= view).then(|| s.inner.view_spec()))
            .await?;
        if spec.view() != view {
            debug!(?view, current = ?spec.view(), "stale proposal");
            return Ok(());
        }
        proposal.verify(&self.committee, &spec)?;
        for qc in &proposal.lane_qcs {
            self.avail.push_lane_qc(qc)?;
        }

        let formed = self.state.update(|s| {
            if s.view() != view || s.inner.prepare_vote.is_some() || s.inner.timeout_vote.is_some() {
                return Vec::new();
            }
            let vote = Signed::new(
                PrepareVote {
                    view,
                    proposal: proposal.proposal().clone(),
                },
                &self.keypair,
            );
            debug!(?view, "prepare vote");
            s.inner.prepare_vote = Some(vote.clone());
            s.cast(self.keypair.pubkey(), ConsensusMessage::PrepareVote(vote));
            s.touch();
            s.settle(&self.committee, &self.keypair)
        });
        self.publish(ctx, formed).await
    }

    pub async fn push_prepare_vote(&self, ctx: &Ctx, vote: Signed<PrepareVote>) -> Result<()> {
        vote.verify(&self.committee)?;
        let formed = self.state.update(|s| {
            let signer = *vote.signer();
            if s.prepare_votes.get(&signer).is_some_and(|old| old.msg.view >= vote.msg.view) {
                return Vec::new();
            }
            s.prepare_votes.insert(signer, vote);
            s.settle(&self.committee, &self.keypair)
        });
        self.publish(ctx, formed).await
    }

    pub async fn push_commit_vote(&self, ctx: &Ctx, vote: Signed<CommitVote>) -> Result<()> {
        vote.verify(&self.committee)?;
        let formed = self.state.update(|s| {
            let signer = *vote.signer();
            if s.commit_votes.get(&signer).is_some_and(|old| old.msg.view >= vote.msg.view) {
                return Vec::new();
            }
            s.commit_votes.insert(signer, vote);
            s.settle(&self.committee, &self.keypair)
        });
        self.publish(ctx, formed).await
    }

    pub async fn push_timeout_vote(&self, ctx: &Ctx, vote: FullTimeoutVote) -> Result<()> {
        vote.verify(&self.committee)?;
        let formed = self.state.update(|s| {
            let signer = *vote.vote.signer();
            if s.timeout_votes.get(&signer).is_some_and(|old| old.view() >= vote.view()) {
                return Vec::new();
            }
            s.timeout_votes.insert(signer, vote);
            s.settle(&self.committee, &self.keypair)
        });
        self.publish(ctx, formed).await
    }

    /// Adopts a timeout QC once this replica has reached its road index.
    pub async fn push_timeout_qc(&self, ctx: &Ctx, tqc: TimeoutQc) -> Result<()> {
        tqc.verify(&self.committee)?;
        let index = tqc.index();
        self.state
            .wait_for(ctx, |s| (s.view().index >= index).then_some(()))
            .await?;
        let formed = self.state.update(|s| {
            if !s.advance_timeout(tqc) {
                return Vec::new();
            }
            s.settle(&self.committee, &self.keypair)
        });
        self.publish(ctx, formed).await
    }

    async fn on_commit_qc(&self, ctx: &Ctx, qc: CommitQc) -> Result<()> {
        let formed = self.state.update(|s| {
            if !s.advance_commit(qc) {
                return Vec::new();
            }
            s.settle(&self.committee, &self.keypair)
        });
        self.publish(ctx, formed).await
    }

    /// Follows the commit QCs accepted by the availability state, which
    /// may come from peers or from a prune that skipped ahead.
    pub async fn run_view_sync(&self, ctx: &Ctx) -> Result<()> {
        let mut rx = self.avail.subscribe_commit_qc();
        loop {
            let latest = rx.borrow_and_update().clone();
            if let Some(qc) = latest {
                self.on_commit_qc(ctx, qc).await?;
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                res = rx.changed() => res.map_err(|_| Error::Canceled)?,
            }
        }
    }

    /// The single writer of the persisted record. Waits for new state or
    /// messages, persists the state, then hands the messages to `out`.
    pub async fn run_output(&self, ctx: &Ctx, out: mpsc::Sender<ConsensusMessage>) -> Result<()> {
        let mut persister = self.persister.lock().await.take();
        let mut persisted = 0;
        loop {
            let (version, snapshot, messages) = self
                .state
                .wait(ctx, |s| {
                    if s.version == persisted && s.outbox.is_empty() {
                        return None;
                    }
                    Some((s.version, s.inner.clone(), std::mem::take(&mut s.outbox)))
                })
                .await?;

            if version != persisted {
                if let Some(mut p) = persister.take() {
                    let p = tokio::task::spawn_blocking(move || p.persist(&snapshot).map(|()| p)).await??;
                    persister = Some(p);
                }
                persisted = version;
            }

            for msg in messages {
                out.send(msg).await.map_err(|_| Error::Canceled)?;
            }
        }
    }

    /// Votes to time out every view that lasts longer than the configured
    /// timeout. Each view is timed out at most once.
    pub async fn run_timeouts(&self, ctx: &Ctx) -> Result<()> {
        loop {
            let view = self.view();
            let timeout = (self.view_timeout)(view);
            let changed = self.state.wait_for(ctx, |s| (s.view() != view).then_some(()));
            tokio::select! {
                res = changed => {
                    res?;
                    continue;
                }
                _ = tokio::time::sleep(timeout) => {}
            }

            let formed = self.state.update(|s| {
                if s.view() != view || s.inner.timeout_vote.is_some() {
                    return Vec::new();
                }
                let high_qc = s.high_prepare_qc();
                let vote = FullTimeoutVote {
                    vote: Signed::new(
                        TimeoutVote {
                            view,
                            high_prepare_view: high_qc.as_ref().map(|qc| qc.view()),
                        },
                        &self.keypair,
                    ),
                    high_qc,
                };
                info!(?view, ?timeout, "timing out view");
                s.inner.timeout_vote = Some(vote.clone());
                s.cast(self.keypair.pubkey(), ConsensusMessage::TimeoutVote(vote));
                s.touch();
                s.settle(&self.committee, &self.keypair)
            });
            self.publish(ctx, formed).await?;
            self.state.wait_for(ctx, |s| (s.view() != view).then_some(())).await?;
        }
    }

    /// Proposes in every view this replica leads. Building a proposal may
    /// wait for lane QCs; it is abandoned if the view moves on first.
    pub async fn run_leader(&self, ctx: &Ctx) -> Result<()> {
        let me = self.keypair.pubkey();
        loop {
            let (view, spec) = self
                .state
                .wait_for(ctx, |s| {
                    let view = s.view();
                    let due = self.committee.leader(view) == me && s.proposed.map_or(true, |p| p < view);
                    due.then(|| (view, s.inner.view_spec()))
                })
                .await?;

            let moved_on = self.state.wait_for(ctx, |s| (s.view() != view).then_some(()));
            let proposal = tokio::select! {
                res = self.build_proposal(ctx, view, &spec) => res?,
                res = moved_on => {
                    res?;
                    continue;
                }
            };

            let fresh = self.state.update(|s| {
                if s.view() != view {
                    return false;
                }
                s.proposed = Some(view);
                s.outbox.push(ConsensusMessage::Proposal(proposal.clone()));
                true
            });
            if !fresh {
                continue;
            }
            info!(
                ?view,
                reproposal = spec.reproposal().is_some(),
                global = ?proposal.proposal().global_range(),
                "proposing"
            );
            match self.push_proposal(ctx, proposal).await {
                Err(Error::Verify(e)) => warn!(?view, error = %e, "own proposal rejected"),
                res => res?,
            }
        }
    }

    async fn build_proposal(&self, ctx: &Ctx, view: View, spec: &ViewSpec) -> Result<FullProposal> {
        if let Some(high_qc) = spec.reproposal() {
            return Ok(FullProposal {
                proposal: Signed::new(
                    LeaderProposal {
                        view,
                        proposal: high_qc.proposal().clone(),
                    },
                    &self.keypair,
                ),
                lane_qcs: Vec::new(),
                app_qc: None,
                timeout_qc: spec.timeout_qc.clone(),
            });
        }

        let prev = spec.commit_qc.as_ref();
        let limit = next_global(prev);
        let finalized_app = prev.and_then(|qc| qc.proposal().app.clone());
        let floor = finalized_app.as_ref().map(|app| app.global_number);
        let (lane_qcs, app_qc) = tokio::select! {
            qcs = self.avail.wait_for_lane_qcs(ctx, prev) => {
                let app_qc = self
                    .avail
                    .latest_app_qc()
                    .filter(|qc| floor.map_or(true, |f| qc.global_number() > f) && qc.global_number() < limit);
                (qcs?, app_qc)
            }
            app_qc = self.avail.wait_for_app_qc(ctx, floor, limit) => (self.avail.lane_qcs(prev), Some(app_qc?)),
        };

        let lane_ranges = self
            .committee
            .replicas()
            .iter()
            .map(|lane| {
                let (first, prev_hash) = lane_start(prev, lane);
                match lane_qcs.get(lane) {
                    Some(qc) => LaneRange {
                        lane: *lane,
                        first,
                        next: qc.header().block_number + 1,
                        last_hash: qc.header().hash(),
                    },
                    None => LaneRange {
                        lane: *lane,
                        first,
                        next: first,
                        last_hash: prev_hash,
                    },
                }
            })
            .collect();
        let proposal = Proposal {
            view,
            created_at_ms: now_ms(),
            lane_ranges,
            app: app_qc.as_ref().map(|qc| qc.proposal().clone()).or(finalized_app),
        };
        Ok(FullProposal {
            proposal: Signed::new(LeaderProposal { view, proposal }, &self.keypair),
            lane_qcs: lane_qcs.into_values().collect(),
            app_qc,
            timeout_qc: spec.timeout_qc.clone(),
        })
    }
}
