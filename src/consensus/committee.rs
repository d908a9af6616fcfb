use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};

use super::message::View;
use crate::common::crypto::{Hash, PublicKey};
use crate::common::{Error, Result};

/*
    The committee is a fixed set of N replicas of which at most
    f = (N - 1) / 3 are faulty. Any two sets of N - f replicas intersect
    in at least one correct replica, which is what makes a prepare, commit,
    timeout or app certificate unique. A lane certificate only has to show
    that at least one correct replica holds the block, so f + 1 suffices.
*/

/// Signature thresholds for each certificate kind.
///
/// These coincide by default but are kept apart so a deployment can tune
/// them independently within the bounds `Committee::with_quorums` checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorums {
    pub lane: usize,
    pub prepare: usize,
    pub commit: usize,
    pub timeout: usize,
    pub app: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
    replicas: Vec<PublicKey>,
    quorums: Quorums,
}

impl Committee {
    pub fn new(mut replicas: Vec<PublicKey>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(Error::Config("empty committee".into()));
        }
        replicas.sort();
        if replicas.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::Config("duplicate committee member".into()));
        }
        let n = replicas.len();
        let f = (n - 1) / 3;
        let quorums = Quorums {
            lane: f + 1,
            prepare: n - f,
            commit: n - f,
            timeout: n - f,
            app: n - f,
        };
        Ok(Committee { replicas, quorums })
    }

    /// Overrides the default thresholds. The lane quorum must lie in
    /// `[f + 1, N]`, every other quorum in `[N - f, N]`.
    pub fn with_quorums(mut self, quorums: Quorums) -> Result<Self> {
        let n = self.n();
        let f = self.faulty();
        let strong = n - f..=n;
        if !(f + 1..=n).contains(&quorums.lane) {
            return Err(Error::Config(format!("lane quorum {} outside [{}, {}]", quorums.lane, f + 1, n)));
        }
        for (name, q) in [
            ("prepare", quorums.prepare),
            ("commit", quorums.commit),
            ("timeout", quorums.timeout),
            ("app", quorums.app),
        ] {
            if !strong.contains(&q) {
                return Err(Error::Config(format!("{name} quorum {q} outside [{}, {n}]", n - f)));
            }
        }
        self.quorums = quorums;
        Ok(self)
    }

    pub fn n(&self) -> usize {
        self.replicas.len()
    }

    pub fn faulty(&self) -> usize {
        (self.n() - 1) / 3
    }

    pub fn quorums(&self) -> &Quorums {
        &self.quorums
    }

    /// Members in canonical (sorted) order. Lanes are laid out in this order.
    pub fn replicas(&self) -> &[PublicKey] {
        &self.replicas
    }

    pub fn is_member(&self, pubkey: &PublicKey) -> bool {
        self.index_of(pubkey).is_some()
    }

    pub fn index_of(&self, pubkey: &PublicKey) -> Option<usize> {
        self.replicas.binary_search(pubkey).ok()
    }

    pub fn leader(&self, view: View) -> PublicKey {
        let mut hasher = Sha256::new();
        hasher.update(view.index.to_be_bytes());
        hasher.update(view.number.to_be_bytes());
        let digest = Hash::finish(hasher);
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        let slot = u64::from_be_bytes(word) % self.n() as u64;
        self.replicas[slot as usize]
    }
}
