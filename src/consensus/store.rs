use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::message::{BlockNumber, LaneId, LaneProposal, RoadIndex, Signed};
use super::persist::{check_state_dir, decode_record, encode_record, sync_dir, write_synced};
use super::qc::CommitQc;
use crate::common::crypto::PublicKey;
use crate::common::{Result, ResultExt};

/*
    One file per item. Writing an item twice is harmless and a torn write
    leaves a file that fails its checksum, which loading skips. Anything
    skipped is fetched again from peers.
*/

fn open_subdir(state_dir: &Path, name: &str) -> Result<PathBuf> {
    check_state_dir(state_dir)?;
    let dir = state_dir.join(name);
    if !dir.exists() {
        fs::create_dir(&dir).context(format!("creating {}", dir.display()))?;
        sync_dir(state_dir)?;
    }
    Ok(dir)
}

fn write_item<T: Serialize>(dir: &Path, file_name: &str, item: &T) -> Result<()> {
    let path = dir.join(file_name);
    let fresh = !path.exists();
    let bytes = encode_record(0, item)?;
    write_synced(&path, &bytes).context(format!("writing {}", path.display()))?;
    if fresh {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Reads every `.pb` file in `dir` whose stem `parse_name` accepts.
fn read_items<K, T: DeserializeOwned>(dir: &Path, parse_name: impl Fn(&str) -> Option<K>) -> Result<Vec<(K, T)>> {
    let mut items = Vec::new();
    for entry in fs::read_dir(dir).context(format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let Some(stem) = path
            .extension()
            .filter(|ext| *ext == "pb")
            .and(path.file_stem())
            .and_then(|s| s.to_str())
        else {
            continue;
        };
        let Some(key) = parse_name(stem) else {
            warn!(path = %path.display(), "skipping unrecognized file");
            continue;
        };
        let bytes = fs::read(&path).context(format!("reading {}", path.display()))?;
        match decode_record::<T>(&bytes) {
            Ok((_, item)) => items.push((key, item)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable file"),
        }
    }
    Ok(items)
}

fn remove_items<K>(dir: &Path, parse_name: impl Fn(&str) -> Option<K>, doomed: impl Fn(&K) -> bool) -> Result<()> {
    let mut removed = 0usize;
    for entry in fs::read_dir(dir).context(format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let key = path.file_stem().and_then(|s| s.to_str()).and_then(&parse_name);
        if key.as_ref().is_some_and(&doomed) {
            fs::remove_file(&path).context(format!("removing {}", path.display()))?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "removed pruned files");
    }
    Ok(())
}

fn parse_lane(hex_key: &str) -> Option<LaneId> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(hex_key, &mut key).ok()?;
    Some(PublicKey::from(&key))
}

fn block_file_name(lane: &LaneId, number: BlockNumber) -> String {
    format!("{lane}_{number}.pb")
}

fn parse_block_name(stem: &str) -> Option<(LaneId, BlockNumber)> {
    let (lane, number) = stem.split_once('_')?;
    Some((parse_lane(lane)?, number.parse().ok()?))
}

/// Lane blocks, stored as `blocks/<lane hex>_<number>.pb`.
pub struct BlockStore {
    dir: PathBuf,
}

impl BlockStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        Ok(BlockStore {
            dir: open_subdir(state_dir, "blocks")?,
        })
    }

    pub fn persist(&self, block: &Signed<LaneProposal>) -> Result<()> {
        let header = &block.msg.block.header;
        write_item(&self.dir, &block_file_name(&header.lane, header.block_number), block)
    }

    /// Every readable block whose contents match its file name.
    pub fn load(&self) -> Result<Vec<Signed<LaneProposal>>> {
        let items = read_items::<_, Signed<LaneProposal>>(&self.dir, parse_block_name)?;
        Ok(items
            .into_iter()
            .filter_map(|((lane, number), block)| {
                let header = &block.msg.block.header;
                if header.lane != lane || header.block_number != number {
                    warn!(?lane, number, "skipping block stored under the wrong name");
                    return None;
                }
                Some(block)
            })
            .collect())
    }

    /// Deletes the blocks of `lane` numbered below `below`.
    pub fn prune(&self, lane: &LaneId, below: BlockNumber) -> Result<()> {
        remove_items(&self.dir, parse_block_name, |(l, n)| l == lane && *n < below)
    }
}

fn parse_qc_name(stem: &str) -> Option<RoadIndex> {
    stem.parse().ok()
}

/// Commit QCs, stored as `commitqcs/<index>.pb`.
pub struct CommitQcStore {
    dir: PathBuf,
}

impl CommitQcStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        Ok(CommitQcStore {
            dir: open_subdir(state_dir, "commitqcs")?,
        })
    }

    pub fn persist(&self, qc: &CommitQc) -> Result<()> {
        write_item(&self.dir, &format!("{}.pb", qc.index()), qc)
    }

    /// The stored commit QCs in index order, cut at the first gap.
    pub fn load(&self) -> Result<Vec<CommitQc>> {
        let mut items = read_items::<_, CommitQc>(&self.dir, parse_qc_name)?;
        items.retain(|(index, qc)| {
            let matches = *index == qc.index();
            if !matches {
                warn!(index, "skipping commit QC stored under the wrong name");
            }
            matches
        });
        items.sort_by_key(|(index, _)| *index);

        let mut qcs: Vec<CommitQc> = Vec::with_capacity(items.len());
        for (index, qc) in items {
            if let Some(last) = qcs.last() {
                if index != last.index() + 1 {
                    warn!(index, after = last.index(), "gap in stored commit QCs, dropping the rest");
                    break;
                }
            }
            qcs.push(qc);
        }
        Ok(qcs)
    }

    /// Deletes the commit QCs with index below `below`.
    pub fn prune(&self, below: RoadIndex) -> Result<()> {
        remove_items(&self.dir, parse_qc_name, |i| *i < below)
    }
}
