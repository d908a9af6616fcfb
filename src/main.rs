/*
    Runs a four-replica committee inside one process. Replicas talk over
    channels through the wire codec, every replica produces a block of
    dummy transactions every few hundred milliseconds, and a toy executor
    folds the finalized blocks into a running app hash.

    RUST_LOG controls verbosity, e.g. RUST_LOG=autobahn=debug.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use autobahn::common::crypto::{Hash, Hashable, Keypair, PublicKey};
use autobahn::common::{Ctx, Result};
use autobahn::consensus::{Committee, Payload};
use autobahn::{Config, Inbound, Message, Node, Outbound};

const REPLICAS: usize = 4;
const RUN_FOR: Duration = Duration::from_secs(20);

fn route(from: PublicKey, mut out: mpsc::Receiver<Outbound>, inboxes: HashMap<PublicKey, mpsc::Sender<Inbound>>) {
    tokio::spawn(async move {
        while let Some(Outbound { to, msg }) = out.recv().await {
            let bytes = match msg.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "cannot encode message");
                    continue;
                }
            };
            for (peer, tx) in &inboxes {
                if *peer == from || to.is_some_and(|t| t != *peer) {
                    continue;
                }
                match Message::decode(&bytes) {
                    Ok(msg) => {
                        let _ = tx.send(Inbound { from, msg }).await;
                    }
                    Err(e) => warn!(error = %e, "cannot decode message"),
                }
            }
        }
    });
}

async fn produce(node: Arc<Node>, ctx: Ctx) -> Result<()> {
    let mut i = 0u64;
    loop {
        let tx = format!("{} tx {i}", node.pubkey()).into_bytes();
        node.produce_block(&ctx, Payload::new(vec![tx])).await?;
        i += 1;
        autobahn::common::ctx::sleep(&ctx, Duration::from_millis(300)).await?;
    }
}

async fn execute(node: Arc<Node>, ctx: Ctx) -> Result<()> {
    let mut n = node.data().first();
    let mut state = Hash::ZERO;
    loop {
        let block = match node.data().block(&ctx, n).await {
            Ok(block) => block,
            Err(e) if e.is_pruned() => {
                n = node.data().first();
                continue;
            }
            Err(e) => return Err(e),
        };
        let mut hasher = Sha256::new();
        hasher.update(state.as_bytes());
        hasher.update(block.hash().as_bytes());
        state = Hash::finish(hasher);
        node.data().push_app_hash(n, state)?;
        n += 1;
    }
}

async fn report(node: Arc<Node>, ctx: Ctx) -> Result<()> {
    let mut commits = node.avail().subscribe_commit_qc();
    loop {
        let latest = commits.borrow_and_update().clone();
        if let Some(qc) = latest {
            let range = qc.global_range();
            info!(index = qc.index(), view = ?qc.view(), first = range.first, next = range.next, "finalized");
        }
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            res = commits.changed() => if res.is_err() { return Ok(()) },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,autobahn=info")))
        .init();

    let keys: Vec<Keypair> = (0..REPLICAS).map(|_| Keypair::new_pair()).collect();
    let committee = Committee::new(keys.iter().map(|k| k.pubkey()).collect())?;
    info!(replicas = committee.n(), faulty = committee.faulty(), "starting committee");

    let ctx = Ctx::new();
    let mut inboxes = HashMap::new();
    let mut nodes = Vec::new();
    for key in keys {
        let node = Arc::new(Node::new(Config::new(committee.clone(), key))?);
        let (in_tx, in_rx) = mpsc::channel(1024);
        let (out_tx, out_rx) = mpsc::channel(1024);
        inboxes.insert(node.pubkey(), in_tx);
        nodes.push((node, in_rx, out_tx, out_rx));
    }

    let mut runs = tokio::task::JoinSet::new();
    for (i, (node, in_rx, out_tx, out_rx)) in nodes.into_iter().enumerate() {
        route(node.pubkey(), out_rx, inboxes.clone());
        tokio::spawn(produce(node.clone(), ctx.clone()));
        tokio::spawn(execute(node.clone(), ctx.clone()));
        if i == 0 {
            tokio::spawn(report(node.clone(), ctx.clone()));
        }
        let ctx = ctx.clone();
        runs.spawn(async move { node.run(&ctx, in_rx, out_tx).await });
    }

    tokio::select! {
        _ = tokio::time::sleep(RUN_FOR) => info!("done"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    ctx.cancel();
    while let Some(res) = runs.join_next().await {
        match res? {
            Err(e) if !e.is_canceled() => return Err(e),
            _ => {}
        }
    }
    Ok(())
}
