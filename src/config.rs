use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::common::crypto::Keypair;
use crate::common::{Error, Result};
use crate::consensus::committee::Committee;
use crate::consensus::message::View;
use crate::consensus::persist::check_state_dir;

/// How long a replica waits in a view before voting to time it out.
pub type ViewTimeout = Arc<dyn Fn(View) -> Duration + Send + Sync>;

/// 1s for the first view at an index, doubling with each timed-out view,
/// capped at 32s.
pub fn default_view_timeout() -> ViewTimeout {
    Arc::new(|view: View| Duration::from_secs(1 << view.number.min(5)))
}

#[derive(Clone)]
pub struct Config {
    pub committee: Committee,
    pub keypair: Keypair,
    pub view_timeout: ViewTimeout,
    /// Where consensus state, blocks and commit QCs are persisted. The
    /// directory must already exist. `None` keeps everything in memory,
    /// which is only safe for tests: a restarted replica could vote twice.
    pub state_dir: Option<PathBuf>,
    /// Most blocks kept per lane before producers and pushers wait.
    pub lane_capacity: usize,
    /// How far past the execution frontier the global data state accepts
    /// commit QCs, in blocks.
    pub data_cache_window: u64,
    /// Drop global data this long after its app proposal was produced.
    /// With `None`, executed blocks and their commit QCs are kept forever.
    pub data_retention: Option<Duration>,
    /// Most messages from one peer that may be handled at once. Messages
    /// beyond that are dropped until earlier ones finish.
    pub peer_in_flight: usize,
}

impl Config {
    pub fn new(committee: Committee, keypair: Keypair) -> Self {
        Config {
            committee,
            keypair,
            view_timeout: default_view_timeout(),
            state_dir: None,
            lane_capacity: 32,
            data_cache_window: 1024,
            data_retention: Some(Duration::from_secs(600)),
            peer_in_flight: 256,
        }
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_view_timeout(mut self, f: impl Fn(View) -> Duration + Send + Sync + 'static) -> Self {
        self.view_timeout = Arc::new(f);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.committee.is_member(&self.keypair.pubkey()) {
            return Err(Error::Config(format!("{:?} is not a committee member", self.keypair.pubkey())));
        }
        if self.lane_capacity == 0 {
            return Err(Error::Config("lane capacity must be positive".into()));
        }
        if self.peer_in_flight == 0 {
            return Err(Error::Config("peer in-flight limit must be positive".into()));
        }
        if self.data_cache_window == 0 {
            return Err(Error::Config("data cache window must be positive".into()));
        }
        if let Some(dir) = &self.state_dir {
            check_state_dir(dir)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("committee", &self.committee)
            .field("keypair", &self.keypair)
            .field("state_dir", &self.state_dir)
            .field("lane_capacity", &self.lane_capacity)
            .field("data_cache_window", &self.data_cache_window)
            .field("data_retention", &self.data_retention)
            .field("peer_in_flight", &self.peer_in_flight)
            .finish_non_exhaustive()
    }
}
