//! ElectrumX JSON-RPC message types.
//!
//! Requests are `{"id", "method", "params"}`; replies carry the same `id`;
//! server pushes carry a `method` and no `id`. Pushes are decided once, at
//! parse time, into the closed [`Notification`] union.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod methods {
    pub const SERVER_PING: &str = "server.ping";
    pub const SERVER_VERSION: &str = "server.version";
    pub const SERVER_FEATURES: &str = "server.features";
    pub const SERVER_PEERS_SUBSCRIBE: &str = "server.peers.subscribe";
    pub const BLOCK_HEADER: &str = "blockchain.block.header";
    pub const BLOCK_HEADERS: &str = "blockchain.block.headers";
    pub const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
    pub const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
    pub const SCRIPTHASH_UNSUBSCRIBE: &str = "blockchain.scripthash.unsubscribe";
    pub const SCRIPTHASH_GET_HISTORY: &str = "blockchain.scripthash.get_history";
    pub const SCRIPTHASH_LISTUNSPENT: &str = "blockchain.scripthash.listunspent";
    pub const TRANSACTION_GET: &str = "blockchain.transaction.get";
    pub const TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
    pub const ESTIMATE_FEE: &str = "blockchain.estimatefee";
}

#[derive(Serialize, Debug)]
pub struct Request<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

/// JSON-RPC error object as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl RpcErrorObject {
    /// Accepts `{code, message}` or anything else, kept verbatim as the message.
    fn from_value(value: Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64);
        let message = value.get("message").and_then(Value::as_str);
        match (code, message) {
            (Some(code), Some(message)) => RpcErrorObject {
                code,
                message: message.to_string(),
            },
            _ => RpcErrorObject {
                code: 0,
                message: match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub result: Result<Value, RpcErrorObject>,
}

/// `blockchain.headers.subscribe` result and push payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipNotification {
    pub height: u64,
    pub hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScripthashNotification {
    pub scripthash: String,
    /// `None` when the script has no history
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NewTip(TipNotification),
    ScripthashStatus(ScripthashNotification),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
    /// A push for a method we do not route
    UnknownMethod(String),
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has neither id nor method")]
    Unclassifiable,

    #[error("bad params for {method}: {reason}")]
    BadParams { method: String, reason: String },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// Classify one inbound line. Bytes that are not UTF-8 fail as JSON.
pub fn parse_incoming(line: impl AsRef<[u8]>) -> Result<Incoming, MessageError> {
    let raw: RawMessage = serde_json::from_slice(line.as_ref())?;

    if let Some(id) = raw.id {
        let result = if raw.error.is_null() {
            Ok(raw.result)
        } else {
            Err(RpcErrorObject::from_value(raw.error))
        };
        return Ok(Incoming::Response(Response { id, result }));
    }

    let Some(method) = raw.method else {
        return Err(MessageError::Unclassifiable);
    };

    let bad = |reason: &str| MessageError::BadParams {
        method: method.clone(),
        reason: reason.to_string(),
    };

    match method.as_str() {
        methods::HEADERS_SUBSCRIBE => {
            let first = raw
                .params
                .as_array()
                .and_then(|p| p.first())
                .cloned()
                .ok_or_else(|| bad("expected [{height, hex}]"))?;
            let tip: TipNotification =
                serde_json::from_value(first).map_err(|e| bad(&e.to_string()))?;
            Ok(Incoming::Notification(Notification::NewTip(tip)))
        }
        methods::SCRIPTHASH_SUBSCRIBE => {
            let params = raw
                .params
                .as_array()
                .ok_or_else(|| bad("expected [scripthash, status]"))?;
            let scripthash = params
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing scripthash"))?
                .to_string();
            let status = params.get(1).and_then(Value::as_str).map(str::to_string);
            Ok(Incoming::Notification(Notification::ScripthashStatus(
                ScripthashNotification { scripthash, status },
            )))
        }
        _ => Ok(Incoming::UnknownMethod(method)),
    }
}

/// `blockchain.block.headers` result.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeaderBatch {
    pub count: usize,
    pub hex: String,
    #[serde(default)]
    pub max: Option<usize>,
}

/// `server.features` result (fields this client reads).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerFeatures {
    pub genesis_hash: String,
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub protocol_min: Option<String>,
    #[serde(default)]
    pub protocol_max: Option<String>,
    #[serde(default)]
    pub hash_function: Option<String>,
    #[serde(default)]
    pub pruning: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HistoryItem {
    pub tx_hash: String,
    /// 0 or -1 for mempool entries
    pub height: i64,
    #[serde(default)]
    pub fee: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UnspentItem {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: u64,
    pub value: u64,
}

/// One `server.peers.subscribe` entry: `[ip, hostname, [features]]`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PeerEntry(pub String, pub String, pub Vec<String>);

impl PeerEntry {
    pub fn host(&self) -> &str {
        &self.1
    }

    /// TLS port advertised as `s<port>`, if any.
    pub fn tls_port(&self) -> Option<u16> {
        self.2
            .iter()
            .find_map(|f| f.strip_prefix('s').and_then(|p| p.parse().ok()))
    }

    /// TCP port advertised as `t<port>`, if any.
    pub fn tcp_port(&self) -> Option<u16> {
        self.2
            .iter()
            .find_map(|f| f.strip_prefix('t').and_then(|p| p.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let params = serde_json::json!([100, 2016]);
        let req = Request {
            id: 7,
            method: methods::BLOCK_HEADERS,
            params: &params,
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"id":7,"method":"blockchain.block.headers","params":[100,2016]}"#
        );
    }

    #[test]
    fn test_parse_response_and_error() {
        let ok = parse_incoming(r#"{"jsonrpc":"2.0","id":3,"result":"pong"}"#).unwrap();
        assert_eq!(
            ok,
            Incoming::Response(Response {
                id: 3,
                result: Ok(Value::String("pong".into()))
            })
        );

        let err = parse_incoming(
            r#"{"id":4,"result":null,"error":{"code":-101,"message":"excessive resource usage"}}"#,
        )
        .unwrap();
        match err {
            Incoming::Response(Response { id: 4, result: Err(e) }) => {
                assert_eq!(e.code, -101);
                assert_eq!(e.message, "excessive resource usage");
            }
            other => panic!("unexpected {:?}", other),
        }

        let bare = parse_incoming(r#"{"id":5,"error":"boom"}"#).unwrap();
        assert!(matches!(
            bare,
            Incoming::Response(Response { result: Err(RpcErrorObject { code: 0, .. }), .. })
        ));
    }

    #[test]
    fn test_parse_notifications() {
        let tip = parse_incoming(
            r#"{"jsonrpc":"2.0","method":"blockchain.headers.subscribe","params":[{"height":5,"hex":"00"}]}"#,
        )
        .unwrap();
        assert_eq!(
            tip,
            Incoming::Notification(Notification::NewTip(TipNotification {
                height: 5,
                hex: "00".into()
            }))
        );

        let sh = parse_incoming(
            r#"{"method":"blockchain.scripthash.subscribe","params":["abcd",null]}"#,
        )
        .unwrap();
        assert_eq!(
            sh,
            Incoming::Notification(Notification::ScripthashStatus(ScripthashNotification {
                scripthash: "abcd".into(),
                status: None
            }))
        );

        let other = parse_incoming(r#"{"method":"server.banner","params":[]}"#).unwrap();
        assert_eq!(other, Incoming::UnknownMethod("server.banner".into()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_incoming("not json"), Err(MessageError::Json(_))));
        assert!(matches!(
            parse_incoming(&b"{\"id\":1,\"result\":\"\xff\"}"[..]),
            Err(MessageError::Json(_))
        ));
        assert!(matches!(parse_incoming("{}"), Err(MessageError::Unclassifiable)));
        assert!(matches!(
            parse_incoming(r#"{"method":"blockchain.headers.subscribe","params":[]}"#),
            Err(MessageError::BadParams { .. })
        ));
    }

    #[test]
    fn test_peer_entry_ports() {
        let entry: PeerEntry = serde_json::from_str(
            r#"["1.2.3.4","electrum.example.org",["v1.4","s50002","t50001"]]"#,
        )
        .unwrap();
        assert_eq!(entry.host(), "electrum.example.org");
        assert_eq!(entry.tls_port(), Some(50002));
        assert_eq!(entry.tcp_port(), Some(50001));
    }
}
