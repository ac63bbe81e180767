//! One server-connection lifecycle: connect, validate, sync, follow, close.
//!
//! A `Node` owns the header chain and the collaborator-facing streams for
//! the life of the process. Each call to [`Node::start`] opens a fresh
//! connection; [`Node::run`] drives it until it fails or the node stops.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::genesis::genesis_header;
use crate::block::{sha256d, BlockHash, BlockHeader};
use crate::chain_error::{ChainResult, SyncResult};
use crate::config::Config;
use crate::error::{NodeError, NodeResult};
use crate::events::ChainEvents;
use crate::headers::chain::{HeaderChain, RecoveryState};
use crate::headers::sync::{HeaderSync, SyncSettings, SyncState};
use crate::network::client::{ClientError, ClientSettings, ElectrumClient};
use crate::network::message::{HistoryItem, ScripthashNotification, TipNotification, UnspentItem};
use crate::network::tls::TlsConfig;
use crate::network::transport::ServerAddress;
use crate::network_type::NetworkType;

/// Snapshot for status reporting.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub connected: bool,
    pub peer: Option<String>,
    pub tip: Option<u64>,
    pub synced: bool,
    pub state: Option<SyncState>,
    pub recovery: RecoveryState,
    pub session_cost: Option<f64>,
}

pub struct Node {
    network: NetworkType,
    address: ServerAddress,
    tls: Option<TlsConfig>,
    client_settings: ClientSettings,
    sync_settings: SyncSettings,
    check_canary: bool,
    chain: Arc<HeaderChain>,
    events: Arc<ChainEvents>,
    /// Child of the process token; cancelled by `stop`
    shutdown: CancellationToken,
    client: RwLock<Option<ElectrumClient>>,
    tips: Mutex<Option<mpsc::Receiver<TipNotification>>>,
    sync: RwLock<Option<Arc<HeaderSync>>>,
    watched: Mutex<BTreeSet<String>>,
    running: AtomicBool,
}

impl Node {
    /// Open the header store and prepare TLS. Does not connect.
    pub fn new(config: &Config, shutdown: &CancellationToken) -> NodeResult<Self> {
        let network = config.network();
        let address = config
            .server_address()
            .map_err(|e| NodeError::Client(ClientError::Connect(e)))?;

        let tls = if address.is_tls() {
            let ca_file = config.server.ca_file.as_deref().map(std::path::Path::new);
            Some(TlsConfig::from_settings(config.server.tls_verify, ca_file)?)
        } else {
            None
        };

        let chain = HeaderChain::open(
            config.header_path(),
            config.start_point(),
            network.header_size(),
        )?;
        info!(
            "📂 Header file {} (start point {})",
            chain.file().path().display(),
            chain.start_point()
        );

        Ok(Self {
            network,
            address,
            tls,
            client_settings: config.client_settings(),
            sync_settings: config.sync_settings(),
            check_canary: config.server.check_canary,
            chain: Arc::new(chain),
            events: Arc::new(ChainEvents::default()),
            shutdown: shutdown.child_token(),
            client: RwLock::new(None),
            tips: Mutex::new(None),
            sync: RwLock::new(None),
            watched: Mutex::new(BTreeSet::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Connect and validate the server. Any previous connection is closed.
    pub async fn start(&self) -> NodeResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(NodeError::Client(ClientError::Cancelled));
        }
        self.disconnect().await;

        let (client, notifications) = ElectrumClient::connect(
            &self.address,
            self.tls.as_ref(),
            self.client_settings.clone(),
            &self.shutdown,
        )
        .await?;

        if let Err(e) = self.validate(&client).await {
            client.close().await;
            return Err(e);
        }

        tokio::spawn(forward_scripthashes(
            notifications.scripthashes,
            Arc::clone(&self.events),
        ));
        *self.tips.lock() = Some(notifications.tips);
        *self.client.write() = Some(client.clone());

        let watched: Vec<String> = self.watched.lock().iter().cloned().collect();
        for scripthash in watched {
            match client.scripthash_subscribe(&scripthash).await {
                Ok(_) => debug!("Re-subscribed {}", scripthash),
                Err(e) if e.is_connection_fatal() => return Err(e.into()),
                Err(e) => warn!("⚠️ Failed to re-subscribe {}: {}", scripthash, e),
            }
        }

        info!("✅ Connected to {}", client.peer());
        Ok(())
    }

    async fn validate(&self, client: &ElectrumClient) -> NodeResult<()> {
        let (software, protocol) = client.server_version().await?;
        info!("🤝 {} speaks protocol {} ({})", client.peer(), protocol, software);

        let expected = self.network.genesis_hash();
        let features = client.server_features().await?;
        if !features.genesis_hash.eq_ignore_ascii_case(expected) {
            return Err(NodeError::GenesisMismatch {
                expected: expected.to_string(),
                actual: features.genesis_hash,
            });
        }

        let header_hex = client.block_header(0).await?;
        let header = BlockHeader::from_hex(&header_hex, self.network.header_size())
            .map_err(|e| ClientError::InvalidResponse(format!("genesis header: {}", e)))?;
        let genesis = genesis_header(self.network);
        if header.block_hash() != genesis.block_hash() {
            return Err(NodeError::GenesisMismatch {
                expected: expected.to_string(),
                actual: header.block_hash().to_display_hex(),
            });
        }

        if self.check_canary {
            if let Some(txid) = self.network.canary_txid() {
                self.check_canary_tx(client, txid).await?;
            }
        }
        Ok(())
    }

    /// The server must serve a known transaction whose hash matches its id.
    async fn check_canary_tx(&self, client: &ElectrumClient, txid: &str) -> NodeResult<()> {
        let failed = |reason: String| NodeError::CanaryFailed {
            txid: txid.to_string(),
            reason,
        };
        let raw_hex = match client.transaction_get(txid).await {
            Ok(hex) => hex,
            Err(e) if e.is_connection_fatal() => return Err(e.into()),
            Err(e) => return Err(failed(e.to_string())),
        };
        let raw = hex::decode(raw_hex.trim()).map_err(|e| failed(e.to_string()))?;
        let computed = BlockHash(sha256d(&raw)).to_display_hex();
        if !computed.eq_ignore_ascii_case(txid) {
            return Err(failed(format!("server returned transaction {}", computed)));
        }
        debug!("Canary transaction {} verified", txid);
        Ok(())
    }

    /// Bulk sync, then follow the tip until the connection ends or the node
    /// stops. Returns `Ok(())` only on a requested stop.
    pub async fn run(&self) -> NodeResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NodeError::AlreadyRunning);
        }
        let result = self.run_connected().await;
        self.running.store(false, Ordering::Release);
        self.disconnect().await;
        result
    }

    async fn run_connected(&self) -> NodeResult<()> {
        let client = self.client()?;
        let tips = self.tips.lock().take().ok_or(NodeError::NotConnected)?;

        let sync = Arc::new(HeaderSync::new(
            Arc::clone(&self.chain),
            Arc::new(client),
            Arc::clone(&self.events),
            self.sync_settings.clone(),
        ));
        *self.sync.write() = Some(Arc::clone(&sync));

        let stop = self.shutdown.child_token();
        match drive(&sync, tips, &stop).await {
            // Teardown on stop fails whatever request was in flight
            Err(e) if stop.is_cancelled() => {
                debug!("Run ended by stop: {}", e);
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Close the current connection, if any. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.tips.lock().take();
        let client = self.client.write().take();
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Stop for good: cancels the run loop and closes the connection.
    pub async fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("🛑 Stopping node");
        }
        self.shutdown.cancel();
        self.disconnect().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn client(&self) -> NodeResult<ElectrumClient> {
        self.client
            .read()
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
            .ok_or(NodeError::NotConnected)
    }

    // ===== Collaborator-facing interface =====

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn chain(&self) -> &Arc<HeaderChain> {
        &self.chain
    }

    /// Highest verified height, pinned during reorg recovery.
    pub fn tip(&self) -> Option<u64> {
        self.chain.tip()
    }

    pub fn is_synced(&self) -> bool {
        self.chain.is_synced()
    }

    pub fn get_header(&self, height: u64) -> ChainResult<BlockHeader> {
        self.chain.get_header(height)
    }

    pub fn get_headers(&self, start: u64, count: u64) -> ChainResult<Vec<BlockHeader>> {
        self.chain.get_headers(start, count)
    }

    /// Tip-changed stream. Handed out once.
    pub fn on_tip_changed(&self) -> Option<mpsc::Receiver<u64>> {
        self.events.take_tip_stream()
    }

    /// Scripthash status stream. Handed out once.
    pub fn on_scripthash_status(&self) -> Option<mpsc::Receiver<ScripthashNotification>> {
        self.events.take_scripthash_stream()
    }

    /// Subscribe and remember the scripthash across reconnects.
    pub async fn subscribe_scripthash(&self, scripthash: &str) -> NodeResult<Option<String>> {
        let status = self.client()?.scripthash_subscribe(scripthash).await?;
        self.watched.lock().insert(scripthash.to_string());
        Ok(status)
    }

    pub async fn unsubscribe_scripthash(&self, scripthash: &str) -> NodeResult<bool> {
        self.watched.lock().remove(scripthash);
        Ok(self.client()?.scripthash_unsubscribe(scripthash).await?)
    }

    pub async fn broadcast(&self, raw_tx_hex: &str) -> NodeResult<String> {
        Ok(self.client()?.transaction_broadcast(raw_tx_hex).await?)
    }

    pub async fn get_history(&self, scripthash: &str) -> NodeResult<Vec<HistoryItem>> {
        Ok(self.client()?.get_history(scripthash).await?)
    }

    pub async fn get_listunspent(&self, scripthash: &str) -> NodeResult<Vec<UnspentItem>> {
        Ok(self.client()?.listunspent(scripthash).await?)
    }

    pub async fn get_raw_transaction(&self, txid: &str) -> NodeResult<String> {
        Ok(self.client()?.transaction_get(txid).await?)
    }

    pub async fn estimate_fee(&self, blocks: u32) -> NodeResult<f64> {
        Ok(self.client()?.estimate_fee(blocks).await?)
    }

    /// State of the current (or last) synchronizer.
    pub fn sync_state(&self) -> Option<SyncState> {
        self.sync.read().as_ref().map(|s| s.state())
    }

    pub fn status(&self) -> NodeStatus {
        let client = self.client().ok();
        NodeStatus {
            connected: client.is_some(),
            peer: client.as_ref().map(|c| c.peer().to_string()),
            tip: self.chain.tip(),
            synced: self.chain.is_synced(),
            state: self.sync_state(),
            recovery: self.chain.recovery(),
            session_cost: client.as_ref().map(|c| c.cost().cost()),
        }
    }
}

/// Relay one connection's scripthash pushes into the long-lived stream.
/// Bulk sync, then follow the tip. A stop during bulk sync ends quietly.
async fn drive(
    sync: &HeaderSync,
    tips: mpsc::Receiver<TipNotification>,
    stop: &CancellationToken,
) -> SyncResult<()> {
    tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        result = sync.bulk_sync() => { result?; }
    }
    sync.follow_tip(tips, stop.clone()).await
}

async fn forward_scripthashes(
    mut statuses: mpsc::Receiver<ScripthashNotification>,
    events: Arc<ChainEvents>,
) {
    while let Some(status) = statuses.recv().await {
        events.emit_scripthash(status);
    }
}
