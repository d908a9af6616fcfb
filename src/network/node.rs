use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::Message;
use crate::common::crypto::{Keypair, PublicKey};
use crate::common::{Ctx, Error, Result, Scope};
use crate::config::Config;
use crate::consensus::availability::{AvailabilityState, Recovered, Stores};
use crate::consensus::committee::Committee;
use crate::consensus::data::DataState;
use crate::consensus::message::{AppVote, Block, LaneId, LaneProposal, LaneVote, Payload, Signed};
use crate::consensus::processor::{open_record, ConsensusMessage, ConsensusState};
use crate::consensus::qc::{CommitQc, FullCommitQc};
use crate::consensus::store::{BlockStore, CommitQcStore};

/// How long the global data state may sit on a missing block before the
/// node asks a peer for it.
const FETCH_DELAY: Duration = Duration::from_millis(500);

/// A message delivered by the transport.
#[derive(Debug)]
pub struct Inbound {
    pub from: PublicKey,
    pub msg: Message,
}

/// A message for the transport. `to: None` goes to every other replica.
#[derive(Debug)]
pub struct Outbound {
    pub to: Option<PublicKey>,
    pub msg: Message,
}

/// One replica: the availability, consensus and global data states, and
/// the tasks connecting them to each other and to the network.
pub struct Node {
    committee: Arc<Committee>,
    keypair: Arc<Keypair>,
    avail: Arc<AvailabilityState>,
    consensus: Arc<ConsensusState>,
    data: Arc<DataState>,
    data_retention: Option<Duration>,
    /// Bounds the handlers running for each peer at once.
    in_flight: HashMap<PublicKey, Arc<Semaphore>>,
    peer_in_flight: usize,
}

impl Node {
    /// Builds a replica from `config`, recovering whatever the state
    /// directory holds. Fails on an invalid config or corrupt state.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let committee = Arc::new(config.committee.clone());
        let keypair = Arc::new(config.keypair.clone());

        let (stores, recovered, persister, inner) = match &config.state_dir {
            Some(dir) => {
                let blocks = BlockStore::open(dir)?;
                let commit_qcs = CommitQcStore::open(dir)?;
                let recovered = Recovered {
                    blocks: blocks.load()?,
                    commit_qcs: commit_qcs.load()?,
                };
                let (persister, inner) = open_record(dir)?;
                let stores = Stores {
                    blocks: Arc::new(blocks),
                    commit_qcs: Arc::new(commit_qcs),
                };
                (Some(stores), recovered, Some(persister), inner)
            }
            None => {
                warn!("no state directory, running without persistence");
                (None, Recovered::default(), None, None)
            }
        };

        let data = match recovered.commit_qcs.first() {
            Some(qc) => DataState::starting_at(
                committee.clone(),
                config.data_cache_window,
                qc.index(),
                qc.global_range().first,
            ),
            None => DataState::new(committee.clone(), config.data_cache_window),
        };
        let avail = Arc::new(AvailabilityState::new(
            committee.clone(),
            keypair.clone(),
            config.lane_capacity,
            stores,
            recovered,
        ));
        let consensus = Arc::new(ConsensusState::new(
            committee.clone(),
            keypair.clone(),
            avail.clone(),
            config.view_timeout.clone(),
            persister,
            inner,
        )?);
        info!(replica = %keypair.pubkey(), view = ?consensus.view(), "node ready");

        let in_flight = committee
            .replicas()
            .iter()
            .map(|peer| (*peer, Arc::new(Semaphore::new(config.peer_in_flight))))
            .collect();
        Ok(Node {
            committee,
            keypair,
            avail,
            consensus,
            data: Arc::new(data),
            data_retention: config.data_retention,
            in_flight,
            peer_in_flight: config.peer_in_flight,
        })
    }

    pub fn pubkey(&self) -> PublicKey {
        self.keypair.pubkey()
    }

    pub fn avail(&self) -> &Arc<AvailabilityState> {
        &self.avail
    }

    pub fn consensus(&self) -> &Arc<ConsensusState> {
        &self.consensus
    }

    pub fn data(&self) -> &Arc<DataState> {
        &self.data
    }

    /// Handlers currently running for messages from `peer`.
    pub fn in_flight(&self, peer: &PublicKey) -> usize {
        self.in_flight
            .get(peer)
            .map_or(0, |sem| self.peer_in_flight - sem.available_permits())
    }

    /// Appends a block with `payload` to this replica's lane.
    pub async fn produce_block(&self, ctx: &Ctx, payload: Payload) -> Result<Signed<LaneProposal>> {
        self.avail.produce_block(ctx, payload).await
    }

    /// Runs the replica until `ctx` is canceled or a task fails.
    pub async fn run(
        self: &Arc<Self>,
        ctx: &Ctx,
        inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<()> {
        let mut scope = Scope::new(ctx);
        let (consensus_tx, consensus_rx) = mpsc::channel(64);

        let node = self.clone();
        let (c, out) = (scope.ctx(), outbound.clone());
        scope.spawn("dispatch", async move { node.run_dispatch(c, inbound, out).await });

        let node = self.clone();
        let c = scope.ctx();
        scope.spawn("consensus_output", async move { node.consensus.run_output(&c, consensus_tx).await });
        let node = self.clone();
        let (c, out) = (scope.ctx(), outbound.clone());
        scope.spawn("consensus_send", async move { node.run_consensus_send(c, consensus_rx, out).await });
        let node = self.clone();
        let c = scope.ctx();
        scope.spawn("view_sync", async move { node.consensus.run_view_sync(&c).await });
        let node = self.clone();
        let c = scope.ctx();
        scope.spawn("timeouts", async move { node.consensus.run_timeouts(&c).await });
        let node = self.clone();
        let c = scope.ctx();
        scope.spawn("leader", async move { node.consensus.run_leader(&c).await });

        let node = self.clone();
        let (c, out) = (scope.ctx(), outbound.clone());
        scope.spawn("restore", async move { node.run_restore(c, out).await });
        let node = self.clone();
        let (c, out) = (scope.ctx(), outbound.clone());
        scope.spawn("lane_broadcast", async move { node.run_lane_broadcast(c, out).await });
        for lane in self.committee.replicas() {
            let node = self.clone();
            let (c, out, lane) = (scope.ctx(), outbound.clone(), *lane);
            scope.spawn("lane_voter", async move { node.run_lane_voter(c, lane, out).await });
        }
        let node = self.clone();
        let (c, out) = (scope.ctx(), outbound.clone());
        scope.spawn("commit_qc_broadcast", async move { node.run_commit_qc_broadcast(c, out).await });
        let node = self.clone();
        let c = scope.ctx();
        scope.spawn("avail_persist", async move { node.avail.run_persist(&c).await });

        let node = self.clone();
        let c = scope.ctx();
        scope.spawn("full_commit_qcs", async move { node.run_full_commit_qcs(c).await });
        let node = self.clone();
        let (c, out) = (scope.ctx(), outbound.clone());
        scope.spawn("app_voter", async move { node.run_app_voter(c, out).await });
        let node = self.clone();
        let (c, out) = (scope.ctx(), outbound);
        scope.spawn("block_fetcher", async move { node.run_block_fetcher(c, out).await });
        if let Some(retention) = self.data_retention {
            let node = self.clone();
            let c = scope.ctx();
            scope.spawn("data_pruning", async move { node.data.run_pruning(&c, retention).await });
        }

        info!(replica = %self.pubkey(), "node running");
        scope.join().await
    }

    async fn send(&self, out: &mpsc::Sender<Outbound>, to: Option<PublicKey>, msg: Message) -> Result<()> {
        out.send(Outbound { to, msg }).await.map_err(|_| Error::Canceled)
    }

    async fn broadcast(&self, out: &mpsc::Sender<Outbound>, msg: Message) -> Result<()> {
        self.send(out, None, msg).await
    }

    /// Hands each inbound message to its own handler task. A handler that
    /// hits a protocol violation only drops its message; local failures
    /// stop the node. A peer with too many handlers still waiting gets its
    /// further messages dropped.
    async fn run_dispatch(
        self: Arc<Self>,
        ctx: Ctx,
        mut inbound: mpsc::Receiver<Inbound>,
        out: mpsc::Sender<Outbound>,
    ) -> Result<()> {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                Some(res) = handlers.join_next(), if !handlers.is_empty() => res??,
                next = inbound.recv() => {
                    let Some(Inbound { from, msg }) = next else {
                        info!("inbound channel closed");
                        return Ok(());
                    };
                    let Some(sem) = self.in_flight.get(&from) else {
                        warn!(?from, kind = msg.kind(), "message from outside the committee");
                        continue;
                    };
                    let Ok(permit) = sem.clone().try_acquire_owned() else {
                        warn!(?from, kind = msg.kind(), "peer has too many messages in flight, dropping");
                        continue;
                    };
                    let node = self.clone();
                    let (ctx, out) = (ctx.clone(), out.clone());
                    handlers.spawn(async move {
                        let _permit = permit;
                        let kind = msg.kind();
                        match node.handle(&ctx, from, msg, &out).await {
                            Err(Error::Verify(e)) => {
                                warn!(?from, kind, error = %e, "dropping invalid message");
                                Ok(())
                            }
                            Err(e @ (Error::Pruned { .. } | Error::OutOfOrder { .. } | Error::NotAvailable { .. })) => {
                                debug!(?from, kind, error = %e, "dropping stale message");
                                Ok(())
                            }
                            res => res,
                        }
                    });
                }
            }
        }
    }

    async fn handle(&self, ctx: &Ctx, from: PublicKey, msg: Message, out: &mpsc::Sender<Outbound>) -> Result<()> {
        match msg {
            Message::Ping(nonce) => self.send(out, Some(from), Message::Pong(nonce)).await,
            Message::Pong(nonce) => {
                debug!(?from, nonce, "pong");
                Ok(())
            }

            Message::Proposal(p) => self.consensus.push_proposal(ctx, p).await,
            Message::PrepareVote(v) => self.consensus.push_prepare_vote(ctx, v).await,
            Message::CommitVote(v) => self.consensus.push_commit_vote(ctx, v).await,
            Message::TimeoutVote(v) => self.consensus.push_timeout_vote(ctx, v).await,
            Message::TimeoutQc(qc) => self.consensus.push_timeout_qc(ctx, qc).await,

            Message::LaneProposal(block) => self.avail.push_block(ctx, block).await,
            Message::LaneVote(vote) => self.avail.push_vote(ctx, vote).await.map(|_| ()),
            Message::CommitQc(qc) => {
                qc.verify(&self.committee)?;
                let (_, next) = self.avail.commit_qc_window();
                for missing in next..qc.index() {
                    self.send(out, Some(from), Message::CommitQcRequest(missing)).await?;
                }
                self.avail.push_commit_qc(ctx, qc).await
            }
            Message::CommitQcRequest(index) => {
                let (first, next) = self.avail.commit_qc_window();
                if index < first || index >= next {
                    debug!(?from, index, "cannot serve commit QC");
                    return Ok(());
                }
                let qc = self.avail.commit_qc(ctx, index).await?;
                self.send(out, Some(from), Message::CommitQc(qc)).await
            }
            Message::AppVote(vote) => self.push_app_vote(ctx, vote, out).await,
            Message::AppQc { app_qc, commit_qc } => self.avail.push_app_qc(app_qc, commit_qc),

            Message::FullCommitQc(qc) => self.data.push_qc(ctx, qc, Vec::new()).await,
            Message::BlockRequest(n) => {
                if n < self.data.first() || n >= self.data.next_block() {
                    debug!(?from, global = n, "cannot serve block");
                    return Ok(());
                }
                let qc = self.data.qc_for(ctx, n).await?;
                let block = self.data.block(ctx, n).await?;
                self.send(out, Some(from), Message::FullCommitQc(qc)).await?;
                self.send(out, Some(from), Message::BlockResponse { number: n, block }).await
            }
            Message::BlockResponse { number, block } => {
                // The commit QC travels just ahead of the block; give it a
                // moment to land.
                match tokio::time::timeout(FETCH_DELAY, self.data.wait_for_header(ctx, number)).await {
                    Ok(res) => res?,
                    Err(_) => {
                        debug!(?from, global = number, "block arrived without its commit QC");
                        return Ok(());
                    }
                }
                self.data.push_block(number, block)
            }
        }
    }

    /// Counts an app vote and shares the app QC if this vote completed it.
    async fn push_app_vote(&self, ctx: &Ctx, vote: Signed<AppVote>, out: &mpsc::Sender<Outbound>) -> Result<()> {
        let Some(app_qc) = self.avail.push_app_vote(ctx, vote).await? else {
            return Ok(());
        };
        let commit_qc = self.avail.commit_qc(ctx, app_qc.road_index()).await?;
        self.broadcast(out, Message::AppQc { app_qc, commit_qc }).await
    }

    async fn run_consensus_send(
        self: Arc<Self>,
        ctx: Ctx,
        mut rx: mpsc::Receiver<ConsensusMessage>,
        out: mpsc::Sender<Outbound>,
    ) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                msg = rx.recv() => msg.ok_or(Error::Canceled)?,
            };
            self.broadcast(&out, msg.into()).await?;
        }
    }

    /// Re-registers the last commit QC of the consensus record, which may
    /// be newer than anything in the commit QC store.
    async fn run_restore(self: Arc<Self>, ctx: Ctx, out: mpsc::Sender<Outbound>) -> Result<()> {
        let Some(qc) = self.consensus.inner().commit_qc else {
            return Ok(());
        };
        let (_, next) = self.avail.commit_qc_window();
        for missing in next..qc.index() {
            self.broadcast(&out, Message::CommitQcRequest(missing)).await?;
        }
        self.avail.push_commit_qc(&ctx, qc).await
    }

    /// Streams this replica's own lane to everyone.
    async fn run_lane_broadcast(self: Arc<Self>, ctx: Ctx, out: mpsc::Sender<Outbound>) -> Result<()> {
        let me = self.pubkey();
        let mut next = 0;
        loop {
            let block = self.avail.next_block(&ctx, &me, next).await?;
            next = block.msg.block.header.block_number + 1;
            self.broadcast(&out, Message::LaneProposal(block)).await?;
        }
    }

    /// Votes for every block of `lane`, in lane order.
    async fn run_lane_voter(self: Arc<Self>, ctx: Ctx, lane: LaneId, out: mpsc::Sender<Outbound>) -> Result<()> {
        let mut next = 0;
        loop {
            let block = self.avail.next_block(&ctx, &lane, next).await?;
            let header = block.msg.block.header.clone();
            next = header.block_number + 1;
            let vote = Signed::new(LaneVote { header }, &self.keypair);
            self.broadcast(&out, Message::LaneVote(vote.clone())).await?;
            match self.avail.push_vote(&ctx, vote).await {
                Err(e) if e.is_pruned() => {}
                res => {
                    res?;
                }
            }
        }
    }

    /// Shares each new commit QC so lagging replicas can catch up.
    async fn run_commit_qc_broadcast(self: Arc<Self>, ctx: Ctx, out: mpsc::Sender<Outbound>) -> Result<()> {
        let mut rx = self.avail.subscribe_commit_qc();
        let mut sent = None;
        loop {
            let latest = rx.borrow_and_update().clone();
            if let Some(qc) = latest {
                if sent.map_or(true, |s| qc.index() > s) {
                    sent = Some(qc.index());
                    self.broadcast(&out, Message::CommitQc(qc)).await?;
                }
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                res = rx.changed() => res.map_err(|_| Error::Canceled)?,
            }
        }
    }

    /// Feeds every commit QC, with the headers and bodies of the blocks it
    /// finalizes, to the global data state. When the blocks are not held
    /// locally the full QC comes from a peer instead.
    async fn run_full_commit_qcs(self: Arc<Self>, ctx: Ctx) -> Result<()> {
        loop {
            let index = self.data.next_road_index();
            let qc = match self.avail.commit_qc(&ctx, index).await {
                Ok(qc) => Some(qc),
                Err(e) if e.is_pruned() => {
                    warn!(index, "commit QC pruned before reaching the data state");
                    None
                }
                Err(e) => return Err(e),
            };
            let assembled = match qc {
                Some(qc) => tokio::select! {
                    res = self.assemble(&ctx, qc) => res?,
                    res = self.data.wait_for_road_index(&ctx, index) => {
                        res?;
                        None
                    }
                },
                None => None,
            };
            match assembled {
                Some((full, bodies)) => self.data.push_qc(&ctx, full, bodies).await?,
                None => self.data.wait_for_road_index(&ctx, index).await?,
            }
        }
    }

    async fn assemble(&self, ctx: &Ctx, qc: CommitQc) -> Result<Option<(FullCommitQc, Vec<Block>)>> {
        let mut bodies = Vec::new();
        for (lane, n) in qc.proposal().blocks() {
            match self.avail.block(ctx, &lane, n).await {
                Ok(block) => bodies.push(block.msg.block),
                Err(e) if e.is_pruned() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let headers = bodies.iter().map(|b: &Block| b.header.clone()).collect();
        Ok(Some((FullCommitQc { qc, headers }, bodies)))
    }

    /// Signs an app vote for every new app proposal of the data state.
    async fn run_app_voter(self: Arc<Self>, ctx: Ctx, out: mpsc::Sender<Outbound>) -> Result<()> {
        let mut last = None;
        loop {
            let proposal = self.data.wait_for_app_proposal(&ctx, last).await?;
            last = Some(proposal.global_number);
            let vote = Signed::new(AppVote { proposal }, &self.keypair);
            self.broadcast(&out, Message::AppVote(vote.clone())).await?;
            match self.push_app_vote(&ctx, vote, &out).await {
                Err(Error::Verify(e)) => warn!(error = %e, "own app vote rejected"),
                res => res?,
            }
        }
    }

    /// Asks a random peer for the next global block whenever the data state
    /// stalls on one that is already finalized.
    async fn run_block_fetcher(self: Arc<Self>, ctx: Ctx, out: mpsc::Sender<Outbound>) -> Result<()> {
        let me = self.pubkey();
        let peers: Vec<PublicKey> = self.committee.replicas().iter().copied().filter(|p| *p != me).collect();
        loop {
            let n = self.data.next_block();
            match tokio::time::timeout(FETCH_DELAY, self.data.wait_for_next_block(&ctx, n)).await {
                Ok(res) => {
                    res?;
                    continue;
                }
                Err(_) => {}
            }
            let finalized = self
                .avail
                .latest_commit_qc()
                .map_or(0, |qc| qc.global_range().next)
                .max(self.data.next_qc());
            if n >= finalized {
                continue;
            }
            let Some(peer) = peers.choose(&mut rand::thread_rng()).copied() else {
                continue;
            };
            debug!(global = n, ?peer, "fetching block");
            self.send(&out, Some(peer), Message::BlockRequest(n)).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use sha2::{Digest, Sha256};

    use super::*;
    use crate::common::crypto::{Hash, Hashable};
    use crate::consensus::message::View;
    use crate::consensus::qc::testonly::Setup;
    use crate::consensus::qc::{FullProposal, TimeoutQc};

    const DEADLINE: Duration = Duration::from_secs(30);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn fast_timeouts(config: Config) -> Config {
        config.with_view_timeout(|view: View| Duration::from_millis(300 << view.number.min(3)))
    }

    /// A committee of in-process nodes joined by channels. Every message
    /// goes through the wire codec on its way.
    struct Cluster {
        setup: Setup,
        nodes: HashMap<PublicKey, Arc<Node>>,
        ctx: Ctx,
        /// Messages matching this are never delivered.
        drop: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
        /// Every proposal and timeout QC sent, in send order.
        sent: Arc<std::sync::Mutex<Vec<Message>>>,
    }

    impl Cluster {
        fn new(setup: Setup, configure: impl Fn(Config) -> Config) -> Self {
            let nodes = setup
                .keys
                .iter()
                .map(|key| {
                    let config = configure(Config::new(setup.committee.clone(), key.clone()));
                    (key.pubkey(), Arc::new(Node::new(config).unwrap()))
                })
                .collect();
            Cluster {
                setup,
                nodes,
                ctx: Ctx::new(),
                drop: Arc::new(|_: &Message| false),
                sent: Arc::default(),
            }
        }

        fn dropping(mut self, drop: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
            self.drop = Arc::new(drop);
            self
        }

        fn timeout_qcs(&self) -> Vec<TimeoutQc> {
            let sent = self.sent.lock().unwrap();
            sent.iter()
                .filter_map(|m| match m {
                    Message::TimeoutQc(tqc) => Some(tqc.clone()),
                    _ => None,
                })
                .collect()
        }

        fn proposals(&self) -> Vec<FullProposal> {
            let sent = self.sent.lock().unwrap();
            sent.iter()
                .filter_map(|m| match m {
                    Message::Proposal(p) => Some(p.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Starts every node except those in `down`.
        fn start(&self, down: &[PublicKey]) {
            let mut inboxes = HashMap::new();
            let mut runs = Vec::new();
            for (key, node) in &self.nodes {
                if down.contains(key) {
                    continue;
                }
                let (in_tx, in_rx) = mpsc::channel(4096);
                let (out_tx, out_rx) = mpsc::channel(4096);
                inboxes.insert(*key, in_tx);
                runs.push((*key, node.clone(), in_rx, out_tx, out_rx));
            }
            for (key, node, in_rx, out_tx, mut out_rx) in runs {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.run(&ctx, in_rx, out_tx).await {
                        assert!(e.is_canceled(), "node failed: {e}");
                    }
                });
                let inboxes = inboxes.clone();
                let (drop, sent) = (self.drop.clone(), self.sent.clone());
                tokio::spawn(async move {
                    while let Some(Outbound { to, msg }) = out_rx.recv().await {
                        if matches!(msg, Message::Proposal(_) | Message::TimeoutQc(_)) {
                            sent.lock().unwrap().push(msg.clone());
                        }
                        if drop(&msg) {
                            continue;
                        }
                        let bytes = msg.encode().unwrap();
                        for (peer, tx) in &inboxes {
                            if *peer == key || to.is_some_and(|t| t != *peer) {
                                continue;
                            }
                            let msg = Message::decode(&bytes).unwrap();
                            let _ = tx.send(Inbound { from: key, msg }).await;
                        }
                    }
                });
            }
        }

        fn node(&self, i: usize) -> &Arc<Node> {
            &self.nodes[&self.setup.keys[i].pubkey()]
        }

        fn live<'a>(&'a self, down: &'a [PublicKey]) -> impl Iterator<Item = &'a Arc<Node>> + 'a {
            self.nodes.iter().filter(|(k, _)| !down.contains(k)).map(|(_, n)| n)
        }

        fn stop(&self) {
            self.ctx.cancel();
        }
    }

    /// Executes every finalized block and reports a running app hash.
    fn spawn_executor(node: Arc<Node>, ctx: Ctx) {
        tokio::spawn(async move {
            let mut n = node.data().first();
            let mut state = Hash::ZERO;
            loop {
                let block = match node.data().block(&ctx, n).await {
                    Ok(block) => block,
                    Err(e) if e.is_pruned() => {
                        n = node.data().first();
                        continue;
                    }
                    Err(_) => return,
                };
                let mut hasher = Sha256::new();
                hasher.update(state.as_bytes());
                hasher.update(block.hash().as_bytes());
                state = Hash::finish(hasher);
                if node.data().push_app_hash(n, state).is_err() {
                    return;
                }
                n += 1;
            }
        });
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let res = tokio::time::timeout(DEADLINE, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(res.is_ok(), "timed out waiting for {what}");
    }

    fn payload(tag: &str) -> Payload {
        Payload::new(vec![tag.as_bytes().to_vec()])
    }

    #[tokio::test]
    async fn test_far_ahead_votes_cannot_pile_up() {
        init_tracing();
        // Arrange
        let setup = Setup::new(4);
        let peer = setup.keys[1].clone();
        let mut config = Config::new(setup.committee.clone(), setup.keys[0].clone());
        config.peer_in_flight = 8;
        let node = Arc::new(Node::new(config).unwrap());
        let ctx = Ctx::new();
        let (in_tx, in_rx) = mpsc::channel(4096);
        let (out_tx, mut out_rx) = mpsc::channel(4096);
        {
            let node = node.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { node.run(&ctx, in_rx, out_tx).await });
        }

        // Act: validly signed votes for blocks far past the lane window,
        // each of which would wait indefinitely.
        for n in 0..1000u64 {
            let block = &setup.blocks(1, 1_000_000 + n, Hash::ZERO, 1)[0];
            let vote = Signed::new(LaneVote { header: block.header.clone() }, &peer);
            let msg = Message::LaneVote(vote);
            in_tx.send(Inbound { from: peer.pubkey(), msg }).await.unwrap();
        }
        let other = setup.keys[2].pubkey();
        in_tx.send(Inbound { from: other, msg: Message::Ping(7) }).await.unwrap();
        let pong = tokio::time::timeout(DEADLINE, async {
            loop {
                match out_rx.recv().await {
                    Some(Outbound { to, msg: Message::Pong(nonce) }) => return (to, nonce),
                    Some(_) => continue,
                    None => panic!("outbound closed"),
                }
            }
        })
        .await
        .unwrap();

        // Assert: other peers are still served and the flood holds only
        // its share of handlers.
        assert_eq!(pong, (Some(other), 7));
        assert_eq!(node.in_flight(&peer.pubkey()), 8);
        ctx.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_block_per_lane_is_finalized_everywhere() {
        init_tracing();
        // Arrange
        let cluster = Cluster::new(Setup::new(4), fast_timeouts);
        let ctx = cluster.ctx.clone();
        let mut produced = Vec::new();
        for node in cluster.nodes.values() {
            let block = node.produce_block(&ctx, payload("tx")).await.unwrap();
            produced.push(block.msg.block.header.clone());
        }

        // Act
        cluster.start(&[]);

        // Assert: every replica finalizes all four blocks.
        eventually("four finalized blocks", || {
            cluster.nodes.values().all(|n| {
                n.avail().latest_commit_qc().is_some_and(|qc| qc.global_range().next == 4)
                    && n.data().next_block() == 4
            })
        })
        .await;
        let last = cluster.node(0).avail().latest_commit_qc().unwrap();
        for node in cluster.nodes.values() {
            for index in 0..=last.index() {
                let qc = node.avail().commit_qc(&ctx, index).await.unwrap();
                let expected = cluster.node(0).avail().commit_qc(&ctx, index).await.unwrap();
                assert_eq!(qc.hash(), expected.hash());
            }
        }
        let mut finalized = Vec::new();
        for n in 0..4 {
            finalized.push(cluster.node(1).data().block(&ctx, n).await.unwrap().header);
        }
        produced.sort_by_key(|h| h.lane);
        finalized.sort_by_key(|h| h.lane);
        assert_eq!(finalized, produced);
        cluster.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silent_leader_is_timed_out() {
        init_tracing();
        // Arrange: the leader of the very first view never starts; the
        // next view has a different leader.
        let setup = loop {
            let setup = Setup::new(4);
            if setup.committee.leader(View::new(0, 0)) != setup.committee.leader(View::new(0, 1)) {
                break setup;
            }
        };
        let silent = setup.committee.leader(View::new(0, 0));
        let cluster = Cluster::new(setup, fast_timeouts);
        let down = [silent];
        let ctx = cluster.ctx.clone();
        for node in cluster.live(&down) {
            node.produce_block(&ctx, payload("tx")).await.unwrap();
        }

        // Act
        cluster.start(&down);

        // Assert: view (0, 0) times out with nothing prepared, and index 0
        // is decided in view (0, 1) on a fresh proposal.
        eventually("commit QC at index 0", || {
            cluster.live(&down).all(|n| n.avail().latest_commit_qc().is_some())
        })
        .await;
        let tqcs: Vec<_> = cluster.timeout_qcs().into_iter().filter(|t| t.index() == 0).collect();
        assert!(!tqcs.is_empty());
        for tqc in &tqcs {
            assert_eq!(tqc.view, View::new(0, 0));
            assert!(tqc.high_qc.is_none());
        }
        let proposals: Vec<_> = cluster.proposals().into_iter().filter(|p| p.view().index == 0).collect();
        assert!(!proposals.is_empty());
        for p in &proposals {
            assert_eq!(p.view(), View::new(0, 1));
            assert!(p.timeout_qc.is_some());
        }
        for node in cluster.live(&down) {
            let qc = node.avail().commit_qc(&ctx, 0).await.unwrap();
            assert_eq!(qc.view(), View::new(0, 1));
            assert_eq!(qc.proposal().view, View::new(0, 1));
            assert!(qc.global_range().next >= 1);
        }
        cluster.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_prepared_proposal_survives_timeout() {
        init_tracing();
        // Arrange: commit votes of view (0, 0) are lost, so its proposal
        // gets a prepare QC but no commit QC.
        let setup = Setup::new(4);
        let first = View::new(0, 0);
        let slow_first_view =
            |config: Config| config.with_view_timeout(|view: View| Duration::from_millis(1000 << view.number.min(3)));
        let cluster = Cluster::new(setup, slow_first_view).dropping(move |msg| {
            matches!(msg, Message::CommitVote(v) if v.msg.view == first)
        });
        let ctx = cluster.ctx.clone();
        for node in cluster.nodes.values() {
            node.produce_block(&ctx, payload("tx")).await.unwrap();
        }

        // Act
        cluster.start(&[]);

        // Assert: the timeout QC carries the prepare QC and index 0 commits
        // the very proposal that was prepared, reproposed in a later view.
        eventually("commit QC at index 0", || {
            cluster.nodes.values().all(|n| n.avail().latest_commit_qc().is_some())
        })
        .await;
        let prepared = cluster
            .proposals()
            .into_iter()
            .find(|p| p.view() == first)
            .expect("no proposal in the first view");
        let tqc = cluster
            .timeout_qcs()
            .into_iter()
            .find(|tqc| tqc.view == first)
            .expect("first view never timed out");
        let high_qc = tqc.high_qc.expect("timeout QC without the prepare QC");
        assert_eq!(high_qc.proposal(), prepared.proposal());
        for node in cluster.nodes.values() {
            let qc = node.avail().commit_qc(&ctx, 0).await.unwrap();
            assert!(qc.view() > first);
            assert_eq!(qc.proposal(), prepared.proposal());
            assert_eq!(qc.proposal().view, first);
        }
        cluster.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_app_qcs_prune_history() {
        init_tracing();
        // Arrange
        let cluster = Cluster::new(Setup::new(4), fast_timeouts);
        let ctx = cluster.ctx.clone();
        for node in cluster.nodes.values() {
            spawn_executor(node.clone(), ctx.clone());
            let node = node.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                for i in 0..20u32 {
                    if node.produce_block(&ctx, payload(&format!("tx {i}"))).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });
        }

        // Act
        cluster.start(&[]);

        // Assert: app QCs form and the oldest commit QCs are pruned.
        eventually("pruned commit QCs", || {
            cluster.nodes.values().all(|n| n.avail().commit_qc_window().0 > 0)
        })
        .await;
        for node in cluster.nodes.values() {
            let app_qc = node.avail().latest_app_qc().unwrap();
            let (first, _) = node.avail().commit_qc_window();
            assert!(app_qc.road_index() >= first);
            let err = node.avail().commit_qc(&ctx, first - 1).await.unwrap_err();
            assert!(err.is_pruned());
            assert!(node.avail().commit_qc(&ctx, first).await.is_ok());
        }
        cluster.stop();
    }

    fn persistent(dir: &Path) -> impl Fn(Config) -> Config + '_ {
        move |config: Config| {
            let dir = dir.join(hex::encode(config.keypair.pubkey().as_ref()));
            std::fs::create_dir_all(&dir).unwrap();
            fast_timeouts(config.with_state_dir(dir))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_committee_resumes_after_restart() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let setup = Setup::new(4);
        let keys = setup.keys.clone();

        // Arrange: finalize a first batch of blocks, then stop everyone.
        let first_run = Cluster::new(setup, persistent(dir.path()));
        let ctx = first_run.ctx.clone();
        for node in first_run.nodes.values() {
            node.produce_block(&ctx, payload("before")).await.unwrap();
        }
        first_run.start(&[]);
        eventually("first batch finalized and stored", || {
            first_run.nodes.iter().all(|(key, n)| {
                let Some(qc) = n.avail().latest_commit_qc() else {
                    return false;
                };
                let stored = dir
                    .path()
                    .join(hex::encode(key.as_ref()))
                    .join("commitqcs")
                    .join(format!("{}.pb", qc.index()));
                n.data().next_block() == 4 && stored.exists()
            })
        })
        .await;
        let indices: HashMap<PublicKey, u64> =
            first_run.nodes.iter().map(|(k, n)| (*k, n.consensus().view().index)).collect();
        first_run.stop();
        // Let the runs unwind and release their files.
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(first_run);

        // Act: restart from the same directories and add more blocks.
        let setup = Setup {
            committee: Committee::new(keys.iter().map(|k| k.pubkey()).collect()).unwrap(),
            keys,
        };
        let second_run = Cluster::new(setup, persistent(dir.path()));
        let ctx = second_run.ctx.clone();
        for (key, node) in &second_run.nodes {
            assert!(node.consensus().view().index >= indices[key], "road index went backwards");
            assert!(node.avail().latest_commit_qc().is_some());
            node.produce_block(&ctx, payload("after")).await.unwrap();
        }
        second_run.start(&[]);

        // Assert
        eventually("second batch finalized", || {
            second_run
                .nodes
                .values()
                .all(|n| n.avail().latest_commit_qc().is_some_and(|qc| qc.global_range().next == 8))
        })
        .await;
        second_run.stop();
    }
}
