//! Verified header chain: height/hash index over the flat header file.
//!
//! Single writer (the synchronizer's worker task), many readers. The index
//! sits behind a `parking_lot::RwLock`; `tip` and `synced` are atomics so the
//! collaborator-facing getters never contend with the writer.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::block::{BlockHash, BlockHeader};
use crate::chain_error::{ChainError, ChainResult};
use crate::headers::file::HeaderFile;

/// Sentinel for "no header stored yet".
const NO_TIP: u64 = u64::MAX;

#[derive(Default)]
struct ChainIndex {
    headers: HashMap<u64, BlockHeader>,
    hash_index: HashMap<BlockHash, u64>,
}

impl ChainIndex {
    fn insert(&mut self, height: u64, header: BlockHeader) {
        let hash = header.block_hash();
        if let Some(old) = self.headers.insert(height, header) {
            self.hash_index.remove(&old.block_hash());
        }
        self.hash_index.insert(hash, height);
    }

    fn remove(&mut self, height: u64) -> Option<BlockHeader> {
        let header = self.headers.remove(&height)?;
        self.hash_index.remove(&header.block_hash());
        Some(header)
    }
}

/// Reorg rewind bookkeeping. While `active`, readers see `recovery_tip`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryState {
    pub active: bool,
    pub recovery_tip: u64,
}

pub struct HeaderChain {
    file: HeaderFile,
    start_point: u64,
    index: RwLock<ChainIndex>,
    tip: AtomicU64,
    synced: AtomicBool,
    recovery: RwLock<RecoveryState>,
}

impl HeaderChain {
    pub fn new(file: HeaderFile, start_point: u64) -> Self {
        Self {
            file,
            start_point,
            index: RwLock::new(ChainIndex::default()),
            tip: AtomicU64::new(NO_TIP),
            synced: AtomicBool::new(false),
            recovery: RwLock::new(RecoveryState::default()),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P, start_point: u64, header_size: usize) -> ChainResult<Self> {
        Ok(Self::new(HeaderFile::open(path, header_size)?, start_point))
    }

    pub fn start_point(&self) -> u64 {
        self.start_point
    }

    pub fn header_size(&self) -> usize {
        self.file.header_size()
    }

    pub fn file(&self) -> &HeaderFile {
        &self.file
    }

    /// Highest verified height held in memory, ignoring recovery pinning.
    pub fn local_tip(&self) -> Option<u64> {
        match self.tip.load(Ordering::Acquire) {
            NO_TIP => None,
            h => Some(h),
        }
    }

    /// Externally visible tip. Pinned to the pre-rewind height while a
    /// reorg recovery is in progress so consumers never see it move back.
    pub fn tip(&self) -> Option<u64> {
        let local = self.local_tip();
        let recovery = *self.recovery.read();
        if recovery.active {
            return Some(local.map_or(recovery.recovery_tip, |t| t.max(recovery.recovery_tip)));
        }
        local
    }

    /// Height the next connected header will occupy.
    pub fn next_height(&self) -> u64 {
        self.local_tip().map_or(self.start_point, |t| t + 1)
    }

    pub fn header_count(&self) -> u64 {
        self.local_tip()
            .map_or(0, |t| t - self.start_point + 1)
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }

    pub fn recovery(&self) -> RecoveryState {
        *self.recovery.read()
    }

    /// Enter (or extend) recovery. The first rewind's tip is kept so a
    /// second rewind never lowers what readers see.
    pub fn begin_recovery(&self, pre_rewind_tip: u64) {
        let mut recovery = self.recovery.write();
        if recovery.active {
            recovery.recovery_tip = recovery.recovery_tip.max(pre_rewind_tip);
        } else {
            *recovery = RecoveryState {
                active: true,
                recovery_tip: pre_rewind_tip,
            };
        }
    }

    /// Returns true if a recovery was in progress.
    pub fn clear_recovery(&self) -> bool {
        let mut recovery = self.recovery.write();
        let was_active = recovery.active;
        *recovery = RecoveryState::default();
        was_active
    }

    /// Append raw serialized headers to the file only.
    pub fn append(&self, raw: &[u8]) -> ChainResult<usize> {
        self.file.append(raw)
    }

    /// Insert headers into the index starting at `start_height`.
    ///
    /// Records decoded before a malformed one stay inserted; callers
    /// re-verify afterwards.
    pub fn store_range(&self, raw: &[u8], start_height: u64) -> ChainResult<usize> {
        let size = self.header_size();
        let mut index = self.index.write();
        let mut stored = 0usize;

        for (i, chunk) in raw.chunks(size).enumerate() {
            let height = start_height + i as u64;
            let header =
                BlockHeader::from_bytes(chunk, size).map_err(|e| ChainError::Deserialize {
                    height,
                    reason: e.to_string(),
                })?;
            index.insert(height, header);
            stored += 1;

            if self.local_tip().map_or(true, |t| height > t) {
                self.tip.store(height, Ordering::Release);
            }
        }

        Ok(stored)
    }

    /// Insert at `tip + 1` and advance the tip by one. Linkage must
    /// already have been checked.
    pub fn store_one(&self, header: BlockHeader) -> u64 {
        let mut index = self.index.write();
        let height = self.next_height();
        index.insert(height, header);
        self.tip.store(height, Ordering::Release);
        height
    }

    /// Persist one already-linked header and index it.
    pub fn extend(&self, header: BlockHeader) -> ChainResult<u64> {
        self.file.append(header.as_bytes())?;
        Ok(self.store_one(header))
    }

    /// True iff `candidate.prev` is the hash of the header at the tip.
    /// An empty chain accepts anything: the start point is trusted.
    pub fn check_can_connect(&self, candidate: &BlockHeader) -> bool {
        let Some(tip) = self.local_tip() else {
            return true;
        };
        let index = self.index.read();
        match index.headers.get(&tip) {
            Some(tip_header) => candidate.prev_blockhash() == tip_header.block_hash(),
            None => false,
        }
    }

    /// Walk back from the tip checking linkage, either `depth` links or,
    /// with `all`, down to the start point.
    pub fn verify_from_tip(&self, depth: u64, all: bool) -> ChainResult<()> {
        let Some(tip) = self.local_tip() else {
            return Ok(());
        };
        let floor = self.start_point + 1;
        let lowest = if all {
            floor
        } else {
            tip.saturating_sub(depth).saturating_add(1).max(floor)
        };
        if tip < lowest {
            return Ok(());
        }

        let index = self.index.read();
        let mut child = index
            .headers
            .get(&tip)
            .ok_or(ChainError::ChainVerifyFailed { height: tip })?;

        for height in (lowest..=tip).rev() {
            let parent = index
                .headers
                .get(&(height - 1))
                .ok_or(ChainError::ChainVerifyFailed { height })?;
            if child.prev_blockhash() != parent.block_hash() {
                return Err(ChainError::ChainVerifyFailed { height });
            }
            child = parent;
        }
        Ok(())
    }

    /// Drop the header at the tip from the index. Returns its height.
    pub fn remove_header_at_tip(&self) -> ChainResult<u64> {
        let mut index = self.index.write();
        let tip = self.local_tip().ok_or(ChainError::NotFound(self.start_point))?;
        index.remove(tip).ok_or(ChainError::NotFound(tip))?;

        let new_tip = if tip == self.start_point { NO_TIP } else { tip - 1 };
        self.tip.store(new_tip, Ordering::Release);
        Ok(tip)
    }

    /// Remove `n` headers from the tail of the file.
    pub fn truncate_file(&self, n: u64) -> ChainResult<u64> {
        if !self.is_synced() {
            return Err(ChainError::TruncateBeforeSync);
        }
        self.file.truncate_headers(n)
    }

    /// Clear the index and reload it from the file.
    pub fn rebuild_from_file(&self) -> ChainResult<usize> {
        let raw = self.file.read_all()?;
        self.reset();
        self.store_range(&raw, self.start_point)
    }

    pub fn reset(&self) {
        let mut index = self.index.write();
        index.headers.clear();
        index.hash_index.clear();
        self.tip.store(NO_TIP, Ordering::Release);
    }

    pub fn get_header(&self, height: u64) -> ChainResult<BlockHeader> {
        self.index
            .read()
            .headers
            .get(&height)
            .cloned()
            .ok_or(ChainError::NotFound(height))
    }

    /// `count` headers starting at `start`; the whole range must lie in
    /// `[start_point, tip]`.
    pub fn get_headers(&self, start: u64, count: u64) -> ChainResult<Vec<BlockHeader>> {
        let index = self.index.read();
        let tip = self.local_tip();
        let range_err = || ChainError::Range {
            start,
            count,
            start_point: self.start_point,
            tip,
        };

        let Some(tip) = tip else {
            return Err(range_err());
        };
        if start < self.start_point || start > tip {
            return Err(range_err());
        }
        if count > 0 && start.saturating_add(count - 1) > tip {
            return Err(range_err());
        }

        (start..start + count)
            .map(|h| index.headers.get(&h).cloned().ok_or(ChainError::NotFound(h)))
            .collect()
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u64> {
        self.index.read().hash_index.get(hash).copied()
    }

    pub fn file_len_bytes(&self) -> ChainResult<u64> {
        self.file.len_bytes()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn chain_with(start_point: u64, n: usize) -> (tempfile::TempDir, HeaderChain, Vec<BlockHeader>) {
        let dir = tempfile::tempdir().unwrap();
        let chain = HeaderChain::open(dir.path().join("headers.bin"), start_point, 80).unwrap();
        let headers = linked_headers(BlockHash::ZERO, n, 0);
        let raw = concat(&headers);
        chain.append(&raw).unwrap();
        chain.store_range(&raw, start_point).unwrap();
        (dir, chain, headers)
    }

    #[test]
    fn test_store_range_sets_tip_and_index() {
        let (_dir, chain, headers) = chain_with(100, 5);
        assert_eq!(chain.local_tip(), Some(104));
        assert_eq!(chain.header_count(), 5);
        assert_eq!(chain.height_of(&headers[2].block_hash()), Some(102));
        assert_eq!(chain.get_header(100).unwrap(), headers[0]);
        chain.verify_from_tip(0, true).unwrap();
    }

    #[test]
    fn test_store_range_keeps_prefix_on_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let chain = HeaderChain::open(dir.path().join("h.bin"), 0, 80).unwrap();
        let mut raw = concat(&linked_headers(BlockHash::ZERO, 3, 0));
        raw.extend_from_slice(&[0u8; 10]);

        let err = chain.store_range(&raw, 0).unwrap_err();
        assert!(matches!(err, ChainError::Deserialize { height: 3, .. }));
        assert_eq!(chain.local_tip(), Some(2));
    }

    #[test]
    fn test_check_can_connect() {
        let (_dir, chain, headers) = chain_with(0, 3);
        let next = linked_headers(headers[2].block_hash(), 1, 9);
        assert!(chain.check_can_connect(&next[0]));

        let orphan = linked_headers(headers[1].block_hash(), 1, 9);
        assert!(!chain.check_can_connect(&orphan[0]));

        assert_eq!(chain.extend(next[0].clone()).unwrap(), 3);
        assert_eq!(chain.file_len_bytes().unwrap(), 4 * 80);
    }

    #[test]
    fn test_verify_detects_break() {
        let dir = tempfile::tempdir().unwrap();
        let chain = HeaderChain::open(dir.path().join("h.bin"), 10, 80).unwrap();
        let mut headers = linked_headers(BlockHash::ZERO, 6, 0);
        headers[3] = linked_headers(BlockHash::ZERO, 1, 7).remove(0);
        chain.store_range(&concat(&headers), 10).unwrap();

        // headers[4].prev no longer matches headers[3]
        assert!(matches!(
            chain.verify_from_tip(0, true),
            Err(ChainError::ChainVerifyFailed { height: 14 })
        ));
        // one link only checks 15 -> 14, which is intact
        chain.verify_from_tip(1, false).unwrap();
        assert!(matches!(
            chain.verify_from_tip(2, false),
            Err(ChainError::ChainVerifyFailed { height: 14 })
        ));
    }

    #[test]
    fn test_remove_and_truncate_keep_file_in_step() {
        let (_dir, chain, _) = chain_with(0, 6);
        assert!(matches!(chain.truncate_file(2), Err(ChainError::TruncateBeforeSync)));

        chain.set_synced(true);
        chain.truncate_file(2).unwrap();
        assert_eq!(chain.remove_header_at_tip().unwrap(), 5);
        assert_eq!(chain.remove_header_at_tip().unwrap(), 4);

        assert_eq!(chain.local_tip(), Some(3));
        assert_eq!(
            chain.file_len_bytes().unwrap(),
            (chain.local_tip().unwrap() - chain.start_point() + 1) * 80
        );
        assert!(matches!(chain.truncate_file(0), Err(ChainError::InvalidTruncate(_))));
    }

    #[test]
    fn test_remove_down_to_empty() {
        let (_dir, chain, _) = chain_with(7, 1);
        assert_eq!(chain.remove_header_at_tip().unwrap(), 7);
        assert_eq!(chain.local_tip(), None);
        assert_eq!(chain.next_height(), 7);
        assert!(chain.remove_header_at_tip().is_err());
    }

    #[test]
    fn test_recovery_pins_visible_tip() {
        let (_dir, chain, _) = chain_with(0, 10);
        chain.begin_recovery(9);
        for _ in 0..4 {
            chain.remove_header_at_tip().unwrap();
        }
        assert_eq!(chain.local_tip(), Some(5));
        assert_eq!(chain.tip(), Some(9));

        // A second rewind never lowers the pinned value
        chain.begin_recovery(5);
        assert_eq!(chain.recovery().recovery_tip, 9);

        assert!(chain.clear_recovery());
        assert_eq!(chain.tip(), Some(5));
        assert!(!chain.clear_recovery());
    }

    #[test]
    fn test_get_headers_range_checks() {
        let (_dir, chain, headers) = chain_with(50, 4);
        assert_eq!(chain.get_headers(51, 3).unwrap(), headers[1..4].to_vec());
        assert!(chain.get_headers(49, 1).is_err());
        assert!(chain.get_headers(54, 1).is_err());
        assert!(chain.get_headers(52, 3).is_err());
        assert!(chain.get_headers(53, 0).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_from_file() {
        let (_dir, chain, headers) = chain_with(0, 4);
        chain.reset();
        assert_eq!(chain.local_tip(), None);
        assert_eq!(chain.rebuild_from_file().unwrap(), 4);
        assert_eq!(chain.get_header(3).unwrap(), headers[3]);
    }

    #[test]
    fn test_linkage_property_over_random_sequences() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        for round in 0..50 {
            let n = rng.gen_range(2..40);
            let mut headers = linked_headers(BlockHash::ZERO, n, round);
            let broken = if rng.gen_bool(0.5) {
                let at = rng.gen_range(1..n);
                headers[at] = linked_headers(BlockHash([round as u8 + 1; 32]), 1, 99).remove(0);
                Some(at as u64)
            } else {
                None
            };

            let dir = tempfile::tempdir().unwrap();
            let chain = HeaderChain::open(dir.path().join("h.bin"), 0, 80).unwrap();
            chain.store_range(&concat(&headers), 0).unwrap();

            match (broken, chain.verify_from_tip(0, true)) {
                (None, Ok(())) => {}
                (Some(at), Err(ChainError::ChainVerifyFailed { height })) => {
                    // Either the replaced header or its child breaks first
                    // when walking down from the tip.
                    assert!(height == at || height == at + 1, "round {}", round);
                }
                (b, r) => panic!("round {}: broken {:?} but verify returned {:?}", round, b, r),
            }
        }
    }
}
