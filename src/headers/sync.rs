//! Header synchronizer: bulk catch-up, then tip-follow with reorg recovery.
//!
//! ```text
//! BulkSync ──► TipFollow ◄──► ReorgRecovering
//!                                  │
//!                                  ▼
//!                              Exhausted (fatal)
//! ```
//!
//! All chain mutation happens on the task that calls [`HeaderSync::bulk_sync`]
//! and then [`HeaderSync::follow_tip`]. Tip pushes from the server are funneled
//! through a bounded FIFO queue into that single worker, together with the
//! retries the worker schedules for itself after a rewind.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block::header::split_headers;
use crate::block::BlockHeader;
use crate::chain_error::{SyncError, SyncResult};
use crate::events::ChainEvents;
use crate::headers::chain::HeaderChain;
use crate::network::client::{ClientError, ClientResult, ElectrumClient};
use crate::network::message::{HeaderBatch, TipNotification};
use crate::network_type::RETARGET_CHUNK;

/// Headers removed from the tip when an unconnectable header arrives.
pub const REWIND: u64 = 8;

/// Gaps wider than this are fetched as one ranged request.
pub const BATCH_THRESHOLD: u64 = 8;

/// Depth of the tip work queue.
pub const TIP_QUEUE_DEPTH: usize = 8;

/// Where the headers come from. Implemented by [`ElectrumClient`]; tests
/// plug in a scripted source.
#[async_trait]
pub trait HeaderSource: Send + Sync {
    async fn block_headers(&self, start: u64, count: usize) -> ClientResult<HeaderBatch>;

    /// Header hex at `height`
    async fn block_header(&self, height: u64) -> ClientResult<String>;

    async fn headers_subscribe(&self) -> ClientResult<TipNotification>;

    /// Whether the session cost is above its soft limit.
    fn over_soft_limit(&self) -> bool {
        false
    }

    fn throttle_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}

#[async_trait]
impl HeaderSource for ElectrumClient {
    async fn block_headers(&self, start: u64, count: usize) -> ClientResult<HeaderBatch> {
        ElectrumClient::block_headers(self, start, count).await
    }

    async fn block_header(&self, height: u64) -> ClientResult<String> {
        ElectrumClient::block_header(self, height).await
    }

    async fn headers_subscribe(&self) -> ClientResult<TipNotification> {
        ElectrumClient::headers_subscribe(self).await
    }

    fn over_soft_limit(&self) -> bool {
        self.cost().over_soft_limit()
    }

    fn throttle_interval(&self) -> Duration {
        self.cost().config().decay_interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    BulkSync,
    TipFollow,
    ReorgRecovering,
    Exhausted,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::BulkSync => "bulk-sync",
            SyncState::TipFollow => "tip-follow",
            SyncState::ReorgRecovering => "reorg-recovering",
            SyncState::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// What to do when the subscribe response reports a height below ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    /// Log and carry on
    #[default]
    Ignore,
    /// Drop the connection so the supervisor picks a fresh one
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub chunk_size: usize,
    pub rewind: u64,
    pub batch_threshold: u64,
    pub queue_depth: usize,
    pub stale_policy: StalePolicy,
    /// Upper bound on consecutive throttle sleeps before a bulk request
    pub max_throttle_waits: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            chunk_size: RETARGET_CHUNK,
            rewind: REWIND,
            batch_threshold: BATCH_THRESHOLD,
            queue_depth: TIP_QUEUE_DEPTH,
            stale_policy: StalePolicy::Ignore,
            max_throttle_waits: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipOrigin {
    /// Reply to our own `blockchain.headers.subscribe`
    Subscribe,
    /// Server push
    Notification,
    /// Re-queued by the worker after a rewind
    Retry,
}

#[derive(Debug, Clone)]
pub struct TipWork {
    pub height: u64,
    pub hex: String,
    pub origin: TipOrigin,
}

impl TipWork {
    pub fn new(tip: TipNotification, origin: TipOrigin) -> Self {
        Self {
            height: tip.height,
            hex: tip.hex,
            origin,
        }
    }
}

enum Connect {
    Advanced,
    /// First header that did not link
    Broken { height: u64 },
}

pub struct HeaderSync {
    chain: Arc<HeaderChain>,
    source: Arc<dyn HeaderSource>,
    events: Arc<ChainEvents>,
    settings: SyncSettings,
    state: RwLock<SyncState>,
}

impl HeaderSync {
    pub fn new(
        chain: Arc<HeaderChain>,
        source: Arc<dyn HeaderSource>,
        events: Arc<ChainEvents>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            chain,
            source,
            events,
            settings,
            state: RwLock::new(SyncState::BulkSync),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn chain(&self) -> &Arc<HeaderChain> {
        &self.chain
    }

    fn set_state(&self, next: SyncState) {
        let mut state = self.state.write();
        if *state != next {
            debug!("🔄 Sync state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Catch up from the on-disk tip in fixed-size chunks until the server
    /// returns a short chunk, then reload and fully verify the file.
    ///
    /// Every chunk must link to the current tip before it is written. A
    /// chunk that does not (the server reorganized while we were away)
    /// triggers a rewind and the catch-up resumes below the fork.
    ///
    /// Returns how many headers were fetched.
    pub async fn bulk_sync(&self) -> SyncResult<u64> {
        self.set_state(SyncState::BulkSync);
        let chain = &self.chain;
        let on_disk = chain.file().header_count()?;

        // Linkage checks need the stored headers in memory
        if !chain.is_synced() || chain.header_count() != on_disk {
            self.load_and_verify()?;
        }

        info!(
            "📥 Bulk sync from height {} ({} header(s) on disk)",
            chain.next_height(),
            on_disk
        );

        let mut chunk = self.settings.chunk_size.max(1);
        let mut fetched = 0u64;
        let mut since_rewind = 0u64;
        loop {
            let (stored, broken) = self.gather(&mut chunk).await?;
            fetched += stored;
            since_rewind += stored;

            let Some(height) = broken else {
                break;
            };
            warn!(
                "🔀 Header at {} does not connect to tip {:?} during catch-up",
                height,
                chain.local_tip()
            );
            // Truncation is only allowed once the stored headers are verified
            if !chain.is_synced() {
                self.load_and_verify()?;
                chain.set_synced(true);
            }
            self.rewind()?;
            since_rewind = 0;
        }

        let loaded = self.load_and_verify()?;
        chain.set_synced(true);

        if since_rewind > 0 && chain.clear_recovery() {
            info!("✅ Reorg recovery completed during catch-up");
        }

        info!(
            "✅ Bulk sync complete: {} header(s) loaded, tip {:?}",
            loaded,
            chain.local_tip()
        );
        self.set_state(SyncState::TipFollow);
        if let Some(tip) = chain.tip() {
            self.events.emit_tip(tip);
        }
        Ok(fetched)
    }

    /// Reload the index from the file and verify every link.
    fn load_and_verify(&self) -> SyncResult<usize> {
        let chain = &self.chain;
        let loaded = chain.rebuild_from_file()?;
        if let Err(e) = chain.verify_from_tip(0, true) {
            error!(
                "❌ Header file {} failed verification: {}",
                chain.file().path().display(),
                e
            );
            return Err(e.into());
        }
        Ok(loaded)
    }

    /// Fetch chunks from the tip until a short chunk or a break. Only the
    /// linked prefix of each chunk is stored. Returns the number stored and
    /// the height of the first header that did not link, if any.
    async fn gather(&self, chunk: &mut usize) -> SyncResult<(u64, Option<u64>)> {
        let chain = &self.chain;
        let size = chain.header_size();
        let mut stored = 0u64;

        loop {
            self.throttle().await;

            let next = chain.next_height();
            let batch = self.source.block_headers(next, *chunk).await?;
            if batch.count > *chunk {
                return Err(self.mismatch(next, *chunk, &batch));
            }
            let raw = self.decode_batch(next, *chunk, &batch)?;

            let linked = self.linked_prefix(next, &raw)?;
            if linked > 0 {
                let bytes = &raw[..linked * size];
                chain.append(bytes)?;
                chain.store_range(bytes, next)?;
                stored += linked as u64;
                debug!(
                    "📥 Stored {} header(s), next height {}",
                    linked,
                    chain.next_height()
                );
            }
            if linked < batch.count {
                return Ok((stored, Some(next + linked as u64)));
            }

            // A server may cap chunks below what we asked for
            if let Some(max) = batch.max {
                if max > 0 && max < *chunk && batch.count == max {
                    debug!("Server caps header chunks at {}", max);
                    *chunk = max;
                    continue;
                }
            }
            if batch.count < *chunk {
                return Ok((stored, None));
            }
        }
    }

    /// How many leading headers of `raw` form a chain hanging off the tip.
    fn linked_prefix(&self, start: u64, raw: &[u8]) -> SyncResult<usize> {
        let mut prev: Option<BlockHeader> = None;
        let mut linked = 0usize;
        for header in split_headers(raw, self.chain.header_size()) {
            let header = header.map_err(|e| SyncError::MalformedHeaders {
                start,
                reason: e.to_string(),
            })?;
            let links = match &prev {
                None => self.chain.check_can_connect(&header),
                Some(parent) => header.prev_blockhash() == parent.block_hash(),
            };
            if !links {
                break;
            }
            prev = Some(header);
            linked += 1;
        }
        Ok(linked)
    }

    /// Subscribe to tips and process them in arrival order until the
    /// connection ends, `cancel` fires or a fatal error occurs.
    pub async fn follow_tip(
        &self,
        tips: mpsc::Receiver<TipNotification>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        let (queue_tx, mut queue) = mpsc::channel(self.settings.queue_depth.max(1));
        let lost = cancel.child_token();

        let current = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            current = self.source.headers_subscribe() => current?,
        };
        info!("📡 Subscribed to headers, server tip {}", current.height);
        if queue_tx
            .send(TipWork::new(current, TipOrigin::Subscribe))
            .await
            .is_err()
        {
            return Err(ClientError::Closed.into());
        }

        let forwarder = tokio::spawn(forward_tips(tips, queue_tx.clone(), lost.clone()));

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = lost.cancelled() => break Err(ClientError::Closed.into()),
                work = queue.recv() => {
                    let Some(work) = work else {
                        break Err(ClientError::Closed.into());
                    };
                    if let Err(e) = self.handle_tip(work, &queue_tx).await {
                        if e.is_fatal() {
                            break Err(e);
                        }
                        warn!("⚠️ Tip update failed, waiting for the next one: {}", e);
                    }
                }
            }
        };

        forwarder.abort();
        result
    }

    /// Process one tip work item.
    pub async fn handle_tip(
        &self,
        work: TipWork,
        retries: &mpsc::Sender<TipWork>,
    ) -> SyncResult<()> {
        let chain = &self.chain;
        let start_point = chain.start_point();

        if work.height < start_point {
            error!(
                "🚨 Server notified height {} below start point {}",
                work.height, start_point
            );
            return Err(SyncError::Misbehaving {
                height: work.height,
                start_point,
            });
        }

        let next = chain.next_height();
        if work.height < next {
            return self.on_stale(&work);
        }

        let notified = BlockHeader::from_hex(&work.hex, chain.header_size())
            .map_err(|e| SyncError::BadNotification(e.to_string()))?;

        let outcome = if work.height == next {
            self.connect(notified)?
        } else {
            self.fill_gap(next, work.height, notified).await?
        };

        match outcome {
            Connect::Advanced => {
                let tip = chain.local_tip().unwrap_or(work.height);
                if chain.clear_recovery() {
                    info!("✅ Reorg recovery complete, tip {}", tip);
                }
                self.set_state(SyncState::TipFollow);
                info!("⛓️ New tip {}", tip);
                self.events.emit_tip(tip);
                Ok(())
            }
            Connect::Broken { height } => {
                warn!(
                    "🔀 Header at {} does not connect to tip {:?}",
                    height,
                    chain.local_tip()
                );
                self.rewind()?;
                let retry = TipWork {
                    origin: TipOrigin::Retry,
                    ..work
                };
                if retries.try_send(retry).is_err() {
                    debug!("Tip queue full, next notification will drive recovery");
                }
                Ok(())
            }
        }
    }

    fn on_stale(&self, work: &TipWork) -> SyncResult<()> {
        let local = self.chain.local_tip().unwrap_or(self.chain.start_point());
        if work.origin != TipOrigin::Subscribe || work.height >= local {
            debug!("Ignoring duplicate tip {} (local {})", work.height, local);
            return Ok(());
        }
        match self.settings.stale_policy {
            StalePolicy::Ignore => {
                info!(
                    "ℹ️ Server tip {} is behind local tip {}, waiting for it to catch up",
                    work.height, local
                );
                Ok(())
            }
            StalePolicy::Disconnect => Err(SyncError::StaleSubscribe {
                server: work.height,
                local,
            }),
        }
    }

    /// Rewind up to `rewind` headers from the tip and pin the visible tip.
    pub fn rewind(&self) -> SyncResult<()> {
        let chain = &self.chain;
        let start_point = chain.start_point();
        let exhausted = || SyncError::Exhausted {
            tip: chain.tip(),
            start_point,
        };

        let Some(tip) = chain.local_tip() else {
            self.set_state(SyncState::Exhausted);
            error!("💀 Reorg recovery exhausted: no headers left above {}", start_point);
            return Err(exhausted());
        };

        // A second rewind this close to the checkpoint would cross it
        if chain.recovery().active && tip - start_point < self.settings.rewind {
            self.set_state(SyncState::Exhausted);
            error!(
                "💀 Reorg recovery exhausted at {} (start point {})",
                tip, start_point
            );
            return Err(exhausted());
        }

        let depth = self.settings.rewind.min(tip - start_point + 1);
        self.set_state(SyncState::ReorgRecovering);
        warn!("⏪ Rewinding {} header(s) from tip {}", depth, tip);

        chain.truncate_file(depth)?;
        for _ in 0..depth {
            chain.remove_header_at_tip()?;
        }
        chain.begin_recovery(tip);
        Ok(())
    }

    fn connect(&self, header: BlockHeader) -> SyncResult<Connect> {
        let height = self.chain.next_height();
        if !self.chain.check_can_connect(&header) {
            return Ok(Connect::Broken { height });
        }
        self.chain.extend(header)?;
        Ok(Connect::Advanced)
    }

    /// Fetch `[next, notified_height)` then connect the notified header.
    /// Headers connected before a break stay connected.
    async fn fill_gap(
        &self,
        next: u64,
        notified_height: u64,
        notified: BlockHeader,
    ) -> SyncResult<Connect> {
        let missing = notified_height - next;
        let size = self.chain.header_size();

        if missing > self.settings.batch_threshold {
            debug!("Fetching {} missing header(s) from {} in batches", missing, next);
            let mut start = next;
            while start < notified_height {
                let count = (notified_height - start).min(self.settings.chunk_size.max(1) as u64)
                    as usize;
                let batch = self.source.block_headers(start, count).await?;
                if batch.count != count {
                    return Err(self.mismatch(start, count, &batch));
                }
                let raw = self.decode_batch(start, count, &batch)?;
                for header in split_headers(&raw, size) {
                    let header = header.map_err(|e| SyncError::MalformedHeaders {
                        start,
                        reason: e.to_string(),
                    })?;
                    if let Connect::Broken { height } = self.connect(header)? {
                        return Ok(Connect::Broken { height });
                    }
                }
                start += count as u64;
            }
        } else {
            debug!("Fetching {} missing header(s) from {} one by one", missing, next);
            for height in next..notified_height {
                let hex = self.source.block_header(height).await?;
                let header = BlockHeader::from_hex(&hex, size).map_err(|e| {
                    SyncError::MalformedHeaders {
                        start: height,
                        reason: e.to_string(),
                    }
                })?;
                if let Connect::Broken { height } = self.connect(header)? {
                    return Ok(Connect::Broken { height });
                }
            }
        }

        self.connect(notified)
    }

    /// Check `len(hex) == count * header_size * 2` and decode.
    fn decode_batch(&self, start: u64, requested: usize, batch: &HeaderBatch) -> SyncResult<Vec<u8>> {
        if batch.hex.len() != batch.count * self.chain.header_size() * 2 {
            return Err(self.mismatch(start, requested, batch));
        }
        hex::decode(&batch.hex).map_err(|e| SyncError::MalformedHeaders {
            start,
            reason: e.to_string(),
        })
    }

    fn mismatch(&self, start: u64, requested: usize, batch: &HeaderBatch) -> SyncError {
        SyncError::BatchMismatch {
            start,
            requested,
            count: batch.count,
            bytes: batch.hex.len() / 2,
        }
    }

    /// Back off while the session cost is above its soft limit.
    async fn throttle(&self) {
        let mut waits = 0;
        while self.source.over_soft_limit() && waits < self.settings.max_throttle_waits {
            if waits == 0 {
                info!("🐢 Session cost above soft limit, slowing down");
            }
            tokio::time::sleep(self.source.throttle_interval()).await;
            waits += 1;
        }
    }
}

/// Move server pushes into the work queue. Fires `lost` when the push sink
/// closes, which happens when the connection is torn down.
async fn forward_tips(
    mut tips: mpsc::Receiver<TipNotification>,
    queue: mpsc::Sender<TipWork>,
    lost: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = lost.cancelled() => return,
            tip = tips.recv() => match tip {
                Some(tip) => {
                    if queue.send(TipWork::new(tip, TipOrigin::Notification)).await.is_err() {
                        return;
                    }
                }
                None => {
                    lost.cancel();
                    return;
                }
            }
        }
    }
}
