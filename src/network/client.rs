//! ElectrumX client: request/response correlation and notification routing
//! over one connection.
//!
//! One task owns the receive side and is the only reader of the socket.
//! Callers serialize onto the shared writer and then park on a private
//! oneshot slot keyed by request id. Server pushes go to two bounded sinks
//! (`tips`, `scripthashes`) without ever blocking the reader: when a sink is
//! full or nobody listens the push is dropped and logged.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::network::message::{
    methods, parse_incoming, HeaderBatch, HistoryItem, Incoming, Notification, PeerEntry,
    Response, ScripthashNotification, ServerFeatures, TipNotification, UnspentItem,
};
use crate::network::session_cost::{CostConfig, SessionCost};
use crate::network::tls::TlsConfig;
use crate::network::transport::{
    BoxedReader, BoxedWriter, ConnectError, ServerAddress, Transport, DEFAULT_DIAL_TIMEOUT,
};
use crate::network::wire::{encode_request, line_codec};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("request cancelled")]
    Cancelled,

    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// Error object returned by the server for one request
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("failed to decode result: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl ClientError {
    /// True when the connection is unusable and must be re-established.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Connect(_)
                | ClientError::Io(_)
                | ClientError::Closed
                | ClientError::Timeout { .. }
        )
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub client_name: String,
    pub protocol_version: String,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Read deadline; must exceed `keepalive_interval`
    pub read_timeout: Duration,
    /// Capacity of each notification sink
    pub notification_buffer: usize,
    pub cost: CostConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_name: format!("exsyncd/{}", env!("CARGO_PKG_VERSION")),
            protocol_version: "1.4".to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            read_timeout: Duration::from_secs(25),
            notification_buffer: 64,
            cost: CostConfig::default(),
        }
    }
}

/// Receiving ends of the two notification sinks. Created before the
/// connection starts reading so no push can arrive without a listener.
pub struct Notifications {
    pub tips: mpsc::Receiver<TipNotification>,
    pub scripthashes: mpsc::Receiver<ScripthashNotification>,
}

type Slot = oneshot::Sender<ClientResult<Value>>;

struct Shared {
    peer: String,
    settings: ClientSettings,
    writer: Mutex<BufWriter<BoxedWriter>>,
    next_id: AtomicU64,
    pending: DashMap<u64, Slot>,
    cost: Arc<SessionCost>,
    /// Stops the reader, keep-alive and decay tasks
    shutdown: CancellationToken,
    /// Fired once teardown has completed
    done: CancellationToken,
    closed: AtomicBool,
    deadline: parking_lot::Mutex<Instant>,
    tip_tx: parking_lot::Mutex<Option<mpsc::Sender<TipNotification>>>,
    scripthash_tx: parking_lot::Mutex<Option<mpsc::Sender<ScripthashNotification>>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn extend_deadline(&self) {
        *self.deadline.lock() = Instant::now() + self.settings.read_timeout;
    }


    /// Tear the connection down exactly once: stop the tasks, fail every
    /// parked request, close both sinks, then signal done.
    fn teardown(&self, reason: &str, cancelled: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🔌 Connection to {} closed: {}", self.peer, reason);

        self.shutdown.cancel();

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let err = if cancelled {
                    ClientError::Cancelled
                } else {
                    ClientError::Closed
                };
                let _ = slot.send(Err(err));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!("Failed {} pending request(s) on {}", failed, self.peer);
        }

        self.tip_tx.lock().take();
        self.scripthash_tx.lock().take();
        self.done.cancel();
    }

    fn dispatch(&self, line: &[u8]) {
        match parse_incoming(line) {
            Ok(Incoming::Response(Response { id, result })) => {
                let Some((_, slot)) = self.pending.remove(&id) else {
                    debug!("Discarding reply for unknown id {} from {}", id, self.peer);
                    return;
                };
                let result = result.map_err(|e| {
                    self.cost.bump_for_error();
                    ClientError::Rpc {
                        code: e.code,
                        message: e.message,
                    }
                });
                // Receiver gone means the caller timed out or was cancelled
                let _ = slot.send(result);
            }
            Ok(Incoming::Notification(Notification::NewTip(tip))) => {
                trace!("📥 Tip notification {} from {}", tip.height, self.peer);
                route(&self.tip_tx, tip, "tip", &self.peer);
            }
            Ok(Incoming::Notification(Notification::ScripthashStatus(status))) => {
                trace!("📥 Scripthash notification {} from {}", status.scripthash, self.peer);
                route(&self.scripthash_tx, status, "scripthash", &self.peer);
            }
            Ok(Incoming::UnknownMethod(method)) => {
                debug!("Ignoring push for unknown method {} from {}", method, self.peer);
            }
            Err(e) => {
                self.cost.bump_for_error();
                warn!("⚠️ Skipping malformed message from {}: {}", self.peer, e);
            }
        }
    }
}

fn route<T>(sink: &parking_lot::Mutex<Option<mpsc::Sender<T>>>, item: T, kind: &str, peer: &str) {
    let guard = sink.lock();
    let Some(tx) = guard.as_ref() else {
        return;
    };
    match tx.try_send(item) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("⚠️ {} notification queue full, dropping push from {}", kind, peer);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("No {} listener, dropping push from {}", kind, peer);
        }
    }
}

/// Handle to one ElectrumX connection. Cheap to clone.
#[derive(Clone)]
pub struct ElectrumClient {
    shared: Arc<Shared>,
}

impl ElectrumClient {
    /// Dial `address` and start the connection tasks.
    pub async fn connect(
        address: &ServerAddress,
        tls: Option<&TlsConfig>,
        settings: ClientSettings,
        parent: &CancellationToken,
    ) -> ClientResult<(Self, Notifications)> {
        let transport = Transport::connect(address, tls, settings.dial_timeout).await?;
        Ok(Self::from_transport(transport, settings, parent))
    }

    /// Start the receive loop, keep-alive and cost decay on an established
    /// transport. The connection closes when `parent` is cancelled.
    pub fn from_transport(
        transport: Transport,
        settings: ClientSettings,
        parent: &CancellationToken,
    ) -> (Self, Notifications) {
        let (peer, reader, writer) = transport.into_split();

        let buffer = settings.notification_buffer.max(1);
        let (tip_tx, tips) = mpsc::channel(buffer);
        let (scripthash_tx, scripthashes) = mpsc::channel(buffer);

        let shared = Arc::new(Shared {
            peer,
            writer: Mutex::new(BufWriter::new(writer)),
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            cost: Arc::new(SessionCost::new(settings.cost.clone())),
            shutdown: parent.child_token(),
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
            deadline: parking_lot::Mutex::new(Instant::now() + settings.read_timeout),
            tip_tx: parking_lot::Mutex::new(Some(tip_tx)),
            scripthash_tx: parking_lot::Mutex::new(Some(scripthash_tx)),
            settings,
        });

        let client = Self { shared };
        let _decay = client.shared.cost.spawn_decay(client.shared.shutdown.clone());
        tokio::spawn(receive_loop(Arc::clone(&client.shared), reader));
        tokio::spawn(keepalive_loop(client.clone()));

        (
            client,
            Notifications {
                tips,
                scripthashes,
            },
        )
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.shared.settings
    }

    pub fn cost(&self) -> &Arc<SessionCost> {
        &self.shared.cost
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        self.shared.done.cancelled().await
    }

    /// Token fired after teardown, for `select!` loops.
    pub fn done_token(&self) -> CancellationToken {
        self.shared.done.clone()
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) {
        let first = !self.shared.is_closed();
        self.shared.teardown("closed locally", false);
        if first {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down writer to {}: {}", self.shared.peer, e);
            }
        }
    }

    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> ClientResult<T> {
        let value = self.call(method, params, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`request`](Self::request) but also gives up when `cancel` fires.
    pub async fn request_with_cancel<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> ClientResult<T> {
        let value = self.call(method, params, Some(cancel)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<Value> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(ClientError::Closed);
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_request(id, method, &params).map_err(ClientError::Encode)?;

        let (tx, rx) = oneshot::channel();
        shared.pending.insert(id, tx);
        // Teardown may have drained the map between the check and the insert
        if shared.is_closed() {
            shared.pending.remove(&id);
            return Err(ClientError::Closed);
        }

        // One deadline covers the write and the wait for the reply
        let timeout = shared.settings.request_timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = || {
            shared.pending.remove(&id);
            shared.cost.bump_for_error();
            warn!("⏱️ {} id={} to {} timed out", method, id, shared.peer);
            ClientError::Timeout {
                method: method.to_string(),
                timeout,
            }
        };

        trace!("📤 {} id={} to {}", method, id, shared.peer);
        let mut writer = tokio::select! {
            writer = shared.writer.lock() => writer,
            _ = tokio::time::sleep_until(deadline) => return Err(timed_out()),
            _ = caller_cancelled(cancel) => {
                shared.pending.remove(&id);
                return Err(ClientError::Cancelled);
            }
            // Teardown fails the parked slot with the right error
            _ = shared.shutdown.cancelled() => return rx.await.unwrap_or(Err(ClientError::Closed)),
        };

        // Once bytes may be on the wire, abandoning the write leaves a
        // partial frame behind and the connection has to go.
        let written = tokio::select! {
            result = write_frame(&mut writer, &frame) => result,
            _ = tokio::time::sleep_until(deadline) => {
                drop(writer);
                let err = timed_out();
                shared.teardown("request write timed out", false);
                return Err(err);
            }
            _ = caller_cancelled(cancel) => {
                drop(writer);
                shared.pending.remove(&id);
                shared.teardown("request cancelled mid-write", false);
                return Err(ClientError::Cancelled);
            }
            _ = shared.shutdown.cancelled() => {
                drop(writer);
                shared.teardown("shutdown", true);
                return rx.await.unwrap_or(Err(ClientError::Closed));
            }
        };
        drop(writer);
        if let Err(e) = written {
            shared.pending.remove(&id);
            shared.teardown(&format!("write failed: {}", e), false);
            return Err(ClientError::Io(e));
        }
        shared.cost.bump_for_bytes(frame.len());

        tokio::select! {
            reply = rx => reply.unwrap_or(Err(ClientError::Closed)),
            _ = tokio::time::sleep_until(deadline) => Err(timed_out()),
            _ = caller_cancelled(cancel) => {
                shared.pending.remove(&id);
                shared.cost.bump_for_error();
                Err(ClientError::Cancelled)
            }
        }
    }

    // ===== Typed protocol calls =====

    /// Must be the first call on a connection. Returns
    /// `(server_software, negotiated_protocol)`.
    pub async fn server_version(&self) -> ClientResult<(String, String)> {
        let settings = &self.shared.settings;
        let reply: Vec<String> = self
            .request(
                methods::SERVER_VERSION,
                json!([settings.client_name, settings.protocol_version]),
            )
            .await?;
        match <[String; 2]>::try_from(reply) {
            Ok([software, protocol]) => Ok((software, protocol)),
            Err(other) => Err(ClientError::InvalidResponse(format!(
                "server.version returned {} element(s)",
                other.len()
            ))),
        }
    }

    pub async fn server_features(&self) -> ClientResult<ServerFeatures> {
        self.request(methods::SERVER_FEATURES, json!([])).await
    }

    pub async fn ping(&self) -> ClientResult<()> {
        let _: Value = self.request(methods::SERVER_PING, json!([])).await?;
        Ok(())
    }

    pub async fn peers_subscribe(&self) -> ClientResult<Vec<PeerEntry>> {
        self.request(methods::SERVER_PEERS_SUBSCRIBE, json!([])).await
    }

    /// Raw header hex at `height`.
    pub async fn block_header(&self, height: u64) -> ClientResult<String> {
        self.request(methods::BLOCK_HEADER, json!([height])).await
    }

    pub async fn block_headers(&self, start: u64, count: usize) -> ClientResult<HeaderBatch> {
        self.request(methods::BLOCK_HEADERS, json!([start, count])).await
    }

    pub async fn headers_subscribe(&self) -> ClientResult<TipNotification> {
        self.request(methods::HEADERS_SUBSCRIBE, json!([])).await
    }

    /// Current status hash, `None` if the script has no history.
    pub async fn scripthash_subscribe(&self, scripthash: &str) -> ClientResult<Option<String>> {
        self.request(methods::SCRIPTHASH_SUBSCRIBE, json!([scripthash]))
            .await
    }

    pub async fn scripthash_unsubscribe(&self, scripthash: &str) -> ClientResult<bool> {
        self.request(methods::SCRIPTHASH_UNSUBSCRIBE, json!([scripthash]))
            .await
    }

    pub async fn get_history(&self, scripthash: &str) -> ClientResult<Vec<HistoryItem>> {
        self.request(methods::SCRIPTHASH_GET_HISTORY, json!([scripthash]))
            .await
    }

    pub async fn listunspent(&self, scripthash: &str) -> ClientResult<Vec<UnspentItem>> {
        self.request(methods::SCRIPTHASH_LISTUNSPENT, json!([scripthash]))
            .await
    }

    /// Raw transaction hex (non-verbose form).
    pub async fn transaction_get(&self, txid: &str) -> ClientResult<String> {
        self.request(methods::TRANSACTION_GET, json!([txid, false]))
            .await
    }

    /// Returns the txid the server computed.
    pub async fn transaction_broadcast(&self, raw_tx_hex: &str) -> ClientResult<String> {
        self.request(methods::TRANSACTION_BROADCAST, json!([raw_tx_hex]))
            .await
    }

    /// Fee rate in coin/kB to confirm within `blocks`; -1 when the server
    /// has no estimate.
    pub async fn estimate_fee(&self, blocks: u32) -> ClientResult<f64> {
        self.request(methods::ESTIMATE_FEE, json!([blocks])).await
    }
}

async fn write_frame(writer: &mut BufWriter<BoxedWriter>, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Resolves when the caller's token fires; never without one.
async fn caller_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn receive_loop(shared: Arc<Shared>, reader: BoxedReader) {
    let mut lines = FramedRead::new(reader, line_codec());
    // FramedRead yields a single None after a decoder error, then resumes
    let mut resume_after_error = false;

    let reason = loop {
        let deadline = *shared.deadline.lock();
        tokio::select! {
            _ = shared.shutdown.cancelled() => break "shutdown",
            _ = tokio::time::sleep_until(deadline) => {
                if *shared.deadline.lock() <= Instant::now() {
                    break "read deadline exceeded";
                }
            }
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    shared.extend_deadline();
                    shared.cost.bump_for_bytes(line.len() + 1);
                    if !line.iter().all(u8::is_ascii_whitespace) {
                        shared.dispatch(&line);
                    }
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    shared.cost.bump_for_error();
                    warn!("⚠️ Skipping oversized line from {}", shared.peer);
                    resume_after_error = true;
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => {
                    warn!("❌ Read error from {}: {}", shared.peer, e);
                    break "read error";
                }
                None if resume_after_error => resume_after_error = false,
                None => break "closed by server (EOF)",
            }
        }
    };

    let cancelled = reason == "shutdown" && !shared.is_closed();
    shared.teardown(reason, cancelled);
}

async fn keepalive_loop(client: ElectrumClient) {
    let interval_len = client.shared.settings.keepalive_interval;
    let mut ticker = tokio::time::interval(interval_len);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = client.shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                client.shared.extend_deadline();
                if let Err(e) = client.ping().await {
                    if !client.is_closed() {
                        warn!("💔 Keep-alive ping to {} failed: {}", client.peer(), e);
                        client.shared.teardown("keep-alive failed", false);
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct MockServer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl MockServer {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.send_raw(&value.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.send_bytes(line.as_bytes()).await;
        }

        async fn send_bytes(&mut self, line: &[u8]) {
            self.writer.write_all(line).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn pair(settings: ClientSettings) -> (ElectrumClient, Notifications, MockServer, CancellationToken) {
        pair_sized(settings, 1 << 16)
    }

    /// `buffer` bounds what the client can write before the server reads.
    fn pair_sized(
        settings: ClientSettings,
        buffer: usize,
    ) -> (ElectrumClient, Notifications, MockServer, CancellationToken) {
        let (client_io, server_io) = tokio::io::duplex(buffer);
        let token = CancellationToken::new();
        let (client, notes) =
            ElectrumClient::from_transport(Transport::from_stream(client_io, "mock"), settings, &token);
        let (r, w) = tokio::io::split(server_io);
        let server = MockServer {
            lines: BufReader::new(r).lines(),
            writer: w,
        };
        (client, notes, server, token)
    }

    #[tokio::test]
    async fn test_out_of_order_replies_delivered_once() {
        let (client, _notes, mut server, _token) = pair(ClientSettings::default());

        let mut calls = Vec::new();
        for i in 0..16u64 {
            let c = client.clone();
            calls.push(tokio::spawn(async move {
                let got: u64 = c.request("test.echo", json!([i])).await.unwrap();
                (i, got)
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..16 {
            requests.push(server.next_request().await);
        }
        let mut ids: Vec<u64> = requests.iter().map(|r| r["id"].as_u64().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);

        for req in requests.iter().rev() {
            server
                .send(json!({"id": req["id"], "result": req["params"][0], "error": null}))
                .await;
        }
        // A duplicate reply for an already-answered id is discarded
        server
            .send(json!({"id": requests[0]["id"], "result": 999, "error": null}))
            .await;

        for call in calls {
            let (sent, got) = call.await.unwrap();
            assert_eq!(sent, got);
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_shape_on_wire() {
        let (client, _notes, mut server, _token) = pair(ClientSettings::default());
        let c = client.clone();
        let call = tokio::spawn(async move { c.block_headers(100, 2016).await });

        let req = server.next_request().await;
        assert_eq!(req["method"], "blockchain.block.headers");
        assert_eq!(req["params"], json!([100, 2016]));
        assert!(req.get("jsonrpc").is_none());

        server
            .send(json!({"id": req["id"], "result": {"count": 0, "hex": "", "max": 2016}}))
            .await;
        let batch = call.await.unwrap().unwrap();
        assert_eq!(batch.count, 0);
        assert_eq!(batch.max, Some(2016));
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_and_closes_sinks() {
        let (client, mut notes, mut server, _token) = pair(ClientSettings::default());
        let c = client.clone();
        let call = tokio::spawn(async move { c.ping().await });

        let _ = server.next_request().await;
        drop(server);

        assert!(matches!(call.await.unwrap(), Err(ClientError::Closed)));
        client.closed().await;
        assert!(client.is_closed());
        assert!(notes.tips.recv().await.is_none());
        assert!(notes.scripthashes.recv().await.is_none());
        assert!(matches!(client.ping().await, Err(ClientError::Closed)));

        // Second close is a no-op
        client.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn test_parent_cancel_fails_pending_as_cancelled() {
        let (client, _notes, mut server, token) = pair(ClientSettings::default());
        let c = client.clone();
        let call = tokio::spawn(async move { c.ping().await });
        let _ = server.next_request().await;

        token.cancel();
        assert!(matches!(call.await.unwrap(), Err(ClientError::Cancelled)));
        client.closed().await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notifications_routed_and_garbage_skipped() {
        let (client, mut notes, mut server, _token) = pair(ClientSettings::default());

        server.send_raw("this is not json").await;
        server
            .send(json!({"method": "blockchain.headers.subscribe", "params": [{"height": 7, "hex": "ab"}]}))
            .await;
        server
            .send(json!({"method": "blockchain.scripthash.subscribe", "params": ["ff00", "beef"]}))
            .await;
        server
            .send(json!({"method": "server.banner", "params": ["hello"]}))
            .await;

        let tip = notes.tips.recv().await.unwrap();
        assert_eq!(tip.height, 7);
        let status = notes.scripthashes.recv().await.unwrap();
        assert_eq!(status.scripthash, "ff00");
        assert_eq!(status.status.as_deref(), Some("beef"));

        // Still alive after the malformed line
        let c = client.clone();
        let call = tokio::spawn(async move { c.estimate_fee(6).await });
        let req = server.next_request().await;
        server.send(json!({"id": req["id"], "result": 0.0001})).await;
        assert!((call.await.unwrap().unwrap() - 0.0001).abs() < 1e-12);
        assert!(client.cost().cost() >= client.cost().config().error_penalty);
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_skipped() {
        let (client, mut notes, mut server, _token) = pair(ClientSettings::default());

        server.send_bytes(b"\xff\xfe garbage").await;
        server
            .send(json!({"method": "blockchain.headers.subscribe", "params": [{"height": 9, "hex": "ab"}]}))
            .await;

        assert_eq!(notes.tips.recv().await.unwrap().height, 9);
        assert!(!client.is_closed());

        let c = client.clone();
        let call = tokio::spawn(async move { c.ping().await });
        let req = server.next_request().await;
        server.send(json!({"id": req["id"], "result": null})).await;
        call.await.unwrap().unwrap();
        assert!(client.cost().cost() >= client.cost().config().error_penalty);
    }

    fn big_tx() -> String {
        "ab".repeat(100_000)
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_closes() {
        let settings = ClientSettings {
            request_timeout: Duration::from_millis(300),
            ..ClientSettings::default()
        };
        // The server never reads, so the write cannot complete
        let (client, _notes, _server, _token) = pair_sized(settings, 64);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.transaction_broadcast(&big_tx()),
        )
        .await
        .expect("call should give up on its own");
        assert!(matches!(result, Err(ClientError::Timeout { .. })));
        assert!(client.is_closed());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_write_gives_way_to_cancel() {
        let (client, _notes, _server, token) = pair_sized(ClientSettings::default(), 64);
        let cancel = CancellationToken::new();

        let c = client.clone();
        let t = cancel.clone();
        let writing = tokio::spawn(async move {
            c.request_with_cancel::<String>(
                methods::TRANSACTION_BROADCAST,
                json!([big_tx()]),
                &t,
            )
            .await
        });
        // Queued behind the stalled write for the writer lock
        let c = client.clone();
        let queued = tokio::spawn(async move { c.ping().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        token.cancel();

        let writing = tokio::time::timeout(Duration::from_secs(2), writing)
            .await
            .expect("cancelled call should return")
            .unwrap();
        assert!(matches!(writing, Err(ClientError::Cancelled)));
        let queued = tokio::time::timeout(Duration::from_secs(2), queued)
            .await
            .expect("queued call should return")
            .unwrap();
        assert!(matches!(
            queued,
            Err(ClientError::Cancelled) | Err(ClientError::Closed)
        ));

        client.closed().await;
        assert_eq!(client.pending_count(), 0);
        // close() must not wait on the abandoned writer
        tokio::time::timeout(Duration::from_secs(2), client.close())
            .await
            .expect("close should not hang");
    }

    #[tokio::test]
    async fn test_rpc_error_is_not_fatal() {
        let (client, _notes, mut server, _token) = pair(ClientSettings::default());
        let c = client.clone();
        let call = tokio::spawn(async move { c.block_header(5).await });
        let req = server.next_request().await;
        server
            .send(json!({"id": req["id"], "result": null, "error": {"code": 1, "message": "height 5 out of range"}}))
            .await;

        match call.await.unwrap() {
            Err(e @ ClientError::Rpc { code: 1, .. }) => assert!(!e.is_connection_fatal()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_removes_slot() {
        let settings = ClientSettings {
            request_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(120),
            ..ClientSettings::default()
        };
        let (client, _notes, mut server, _token) = pair(settings);
        let c = client.clone();
        let call = tokio::spawn(async move { c.server_features().await });
        let _ = server.next_request().await;

        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::Timeout { .. })
        ));
        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_server_version_pair() {
        let (client, _notes, mut server, _token) = pair(ClientSettings::default());
        let c = client.clone();
        let call = tokio::spawn(async move { c.server_version().await });
        let req = server.next_request().await;
        assert_eq!(req["params"][1], "1.4");
        server
            .send(json!({"id": req["id"], "result": ["ElectrumX 1.16.0", "1.4"]}))
            .await;
        let (software, protocol) = call.await.unwrap().unwrap();
        assert_eq!(software, "ElectrumX 1.16.0");
        assert_eq!(protocol, "1.4");
    }
}
