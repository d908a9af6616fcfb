/*
    Autobahn replicates a log across a fixed committee of N replicas, of
    which up to f = (N - 1) / 3 may be faulty. It runs in two layers.

    Underneath, every replica keeps its own lane: a hash-linked chain of
    blocks it produces and streams to everyone. Replicas vote on each
    block they receive, and f + 1 votes on a block make a lane QC, proving
    that at least one correct replica holds it and its ancestors.

    On top, a view-based agreement protocol decides, road index by road
    index, how far each lane is finalized. One commit QC thereby orders a
    whole batch of lane blocks at once, which the global data state
    numbers into a single sequence for execution. Replicas then certify
    the app hash that execution produced, and that certificate, together
    with the commit QC it refers to, lets everyone drop the history behind
    it.
*/

pub mod common;
pub mod config;
pub mod consensus;
pub mod network;

pub use config::Config;
pub use network::node::{Inbound, Node, Outbound};
pub use network::Message;
