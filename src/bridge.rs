//! Secure message bridge
//!
//! Authenticated duplex channel between the two privilege-separated
//! execution contexts (the isolated coordinator side and the page main
//! world). Every envelope carries the per-page-load session token; inbound
//! traffic is validated against the expected source identity and an exact
//! token match before any dispatch, and mismatches are dropped without a
//! reply so a probing page learns nothing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

use crate::error::{Error, Result};

/// Event name relayed to the external detection aggregator
pub const DETECTION_EVENT: &str = "fingerprinting_detected";

/// Random secret minted once per page load; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    /// Mint a fresh token
    pub fn mint() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mint a correlation/message id
pub fn mint_id() -> String {
    let bytes: [u8; 12] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// The two execution contexts the bridge connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum World {
    /// Privileged coordinator context
    Isolated,
    /// Page main world where the engine runs
    Main,
}

/// Envelope types on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgKind {
    #[serde(rename = "PS_REQUEST")]
    Request,
    #[serde(rename = "PS_RESPONSE")]
    Response,
    #[serde(rename = "PS_EVENT")]
    Event,
    #[serde(rename = "PS_ACK")]
    Ack,
}

/// One message crossing the context boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MsgKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub token: String,
}

/// An envelope plus the transport-level identity of its sender
#[derive(Debug, Clone)]
pub struct Posted {
    pub source: World,
    pub envelope: Envelope,
}

type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    acks: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    /// Acks that arrived before anyone registered for them
    early_acks: Mutex<HashSet<String>>,
    events: Mutex<HashMap<String, EventHandler>>,
    requests: Mutex<HashMap<String, RequestHandler>>,
    detection_sink: Mutex<Option<EventHandler>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            early_acks: Mutex::new(HashSet::new()),
            events: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            detection_sink: Mutex::new(None),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One endpoint of the authenticated duplex channel
pub struct Bridge {
    side: World,
    token: SessionToken,
    outbound: mpsc::Sender<Posted>,
    shared: Arc<Shared>,
}

impl Bridge {
    /// Build an endpoint over raw transport halves and spawn its
    /// dispatcher. `side` is stamped on outgoing traffic; only messages
    /// whose source is `peer` are accepted.
    pub fn channel(
        side: World,
        peer: World,
        token: SessionToken,
        outbound: mpsc::Sender<Posted>,
        inbound: mpsc::Receiver<Posted>,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            side,
            token,
            outbound,
            shared: Arc::new(Shared::new()),
        });

        let shared = Arc::clone(&bridge.shared);
        let reply_out = bridge.outbound.clone();
        let expected_token = bridge.token.clone();
        tokio::spawn(dispatch_loop(
            side,
            peer,
            expected_token,
            reply_out,
            inbound,
            shared,
        ));

        bridge
    }

    /// In-process pair: (isolated endpoint, main-world endpoint)
    pub fn pair(token: &SessionToken) -> (Arc<Bridge>, Arc<Bridge>) {
        let (to_main_tx, to_main_rx) = mpsc::channel(64);
        let (to_isolated_tx, to_isolated_rx) = mpsc::channel(64);

        let isolated = Bridge::channel(
            World::Isolated,
            World::Main,
            token.clone(),
            to_main_tx,
            to_isolated_rx,
        );
        let main = Bridge::channel(
            World::Main,
            World::Isolated,
            token.clone(),
            to_isolated_tx,
            to_main_rx,
        );
        (isolated, main)
    }

    pub fn side(&self) -> World {
        self.side
    }

    /// Send a named request and await the matching response.
    ///
    /// Each in-flight request is tracked independently by id; on timeout
    /// the pending entry is removed and only this caller fails.
    pub async fn request(&self, name: &str, payload: Value, timeout_ms: u64) -> Result<Value> {
        let id = mint_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id.clone(), tx);

        let envelope = Envelope {
            kind: MsgKind::Request,
            id: Some(id.clone()),
            payload: Some(json!({ "request": name, "data": payload })),
            token: self.token.as_str().to_string(),
        };
        if let Err(err) = self.post(envelope).await {
            lock(&self.shared.pending).remove(&id);
            return Err(err);
        }

        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                lock(&self.shared.pending).remove(&id);
                Err(Error::BridgeClosed("response channel dropped".into()))
            }
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                Err(Error::BridgeTimeout { id, timeout_ms })
            }
        }
    }

    /// Register a handler for a named event
    pub fn on(&self, event: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        lock(&self.shared.events).insert(event.to_string(), Arc::new(handler));
    }

    /// Serve named requests from the peer
    pub fn on_request(
        &self,
        name: &str,
        handler: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) {
        lock(&self.shared.requests).insert(name.to_string(), Arc::new(handler));
    }

    /// Route `fingerprinting_detected` events to an external aggregator in
    /// addition to any registered handler
    pub fn set_detection_relay(&self, sink: impl Fn(Value) + Send + Sync + 'static) {
        *lock(&self.shared.detection_sink) = Some(Arc::new(sink));
    }

    /// Emit a named event without awaiting channel capacity; used from
    /// synchronous callback contexts
    pub fn emit_now(&self, event: &str, data: Value) -> Result<()> {
        self.outbound
            .try_send(Posted {
                source: self.side,
                envelope: Envelope {
                    kind: MsgKind::Event,
                    id: None,
                    payload: Some(json!({ "event": event, "data": data })),
                    token: self.token.as_str().to_string(),
                },
            })
            .map_err(|_| Error::BridgeClosed("peer transport gone or full".into()))
    }

    /// Emit a named event to the peer
    pub async fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.post(Envelope {
            kind: MsgKind::Event,
            id: None,
            payload: Some(json!({ "event": event, "data": data })),
            token: self.token.as_str().to_string(),
        })
        .await
    }

    /// Acknowledge a correlation id, optionally with a payload
    pub async fn ack(&self, id: &str, data: Value) -> Result<()> {
        self.post(Envelope {
            kind: MsgKind::Ack,
            id: Some(id.to_string()),
            payload: Some(data),
            token: self.token.as_str().to_string(),
        })
        .await
    }

    /// Register interest in an ACK before triggering the work that will
    /// produce it, avoiding the lost-wakeup race
    pub fn expect_ack(&self, id: &str) -> AckWaiter {
        if lock(&self.shared.early_acks).remove(id) {
            return AckWaiter { rx: None };
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.acks).insert(id.to_string(), tx);
        // The ack may have landed between the two locks
        if lock(&self.shared.early_acks).remove(id) {
            lock(&self.shared.acks).remove(id);
            return AckWaiter { rx: None };
        }
        AckWaiter { rx: Some(rx) }
    }

    /// Resolve true on a matching ACK, false on timeout
    pub async fn wait_for_ack(&self, id: &str, timeout_ms: u64) -> bool {
        let waiter = self.expect_ack(id);
        waiter.wait(&self.shared, id, timeout_ms).await
    }

    async fn post(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(Posted {
                source: self.side,
                envelope,
            })
            .await
            .map_err(|_| Error::BridgeClosed("peer transport gone".into()))
    }
}

/// Pending ACK registration returned by [`Bridge::expect_ack`]
pub struct AckWaiter {
    /// `None` when the ACK already arrived before registration
    rx: Option<oneshot::Receiver<bool>>,
}

impl AckWaiter {
    async fn wait(self, shared: &Shared, id: &str, timeout_ms: u64) -> bool {
        let Some(rx) = self.rx else {
            return true;
        };
        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(acked)) => acked,
            _ => {
                lock(&shared.acks).remove(id);
                false
            }
        }
    }

    /// Await the ACK through its owning bridge
    pub async fn wait_on(self, bridge: &Bridge, id: &str, timeout_ms: u64) -> bool {
        self.wait(&bridge.shared, id, timeout_ms).await
    }
}

async fn dispatch_loop(
    side: World,
    peer: World,
    token: SessionToken,
    reply_out: mpsc::Sender<Posted>,
    mut inbound: mpsc::Receiver<Posted>,
    shared: Arc<Shared>,
) {
    while let Some(posted) = inbound.recv().await {
        // Source identity first, then exact token match; anything else is
        // dropped silently with no reply
        if posted.source != peer {
            tracing::trace!(?side, "dropping envelope from unexpected source");
            continue;
        }
        let envelope = posted.envelope;
        if envelope.token != token.as_str() {
            tracing::trace!(?side, "dropping envelope with mismatched token");
            continue;
        }

        match envelope.kind {
            MsgKind::Response => {
                let Some(id) = envelope.id else { continue };
                if let Some(tx) = lock(&shared.pending).remove(&id) {
                    let _ = tx.send(envelope.payload.unwrap_or(Value::Null));
                } else {
                    tracing::trace!("response for unknown id {id}");
                }
            }
            MsgKind::Ack => {
                let Some(id) = envelope.id else { continue };
                if let Some(tx) = lock(&shared.acks).remove(&id) {
                    let _ = tx.send(true);
                } else {
                    lock(&shared.early_acks).insert(id);
                }
            }
            MsgKind::Event => {
                let payload = envelope.payload.unwrap_or_else(|| json!({}));
                let name = payload
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let data = payload.get("data").cloned().unwrap_or(Value::Null);

                if name == DETECTION_EVENT {
                    let sink = lock(&shared.detection_sink).clone();
                    if let Some(sink) = sink {
                        sink(data.clone());
                    }
                }
                let handler = lock(&shared.events).get(&name).cloned();
                if let Some(handler) = handler {
                    handler(data);
                }
            }
            MsgKind::Request => {
                let Some(id) = envelope.id else { continue };
                let payload = envelope.payload.unwrap_or_else(|| json!({}));
                let name = payload
                    .get("request")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let data = payload.get("data").cloned().unwrap_or(Value::Null);

                let handler = lock(&shared.requests).get(&name).cloned();
                let Some(handler) = handler else {
                    tracing::trace!("no handler for request '{name}'");
                    continue;
                };
                let result = match handler(data) {
                    Ok(value) => value,
                    Err(err) => json!({ "error": err.to_string() }),
                };
                let reply = Posted {
                    source: side,
                    envelope: Envelope {
                        kind: MsgKind::Response,
                        id: Some(id),
                        payload: Some(result),
                        token: token.as_str().to_string(),
                    },
                };
                if reply_out.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::trace!(?side, "bridge dispatcher ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let token = SessionToken::mint();
        let (isolated, main) = Bridge::pair(&token);

        main.on_request("GET_PERSONA", |data| {
            assert_eq!(data["osPreference"], "macos");
            Ok(json!({ "id": "persona-7" }))
        });

        let value = isolated
            .request("GET_PERSONA", json!({ "osPreference": "macos" }), 1000)
            .await
            .unwrap();
        assert_eq!(value["id"], "persona-7");
    }

    #[tokio::test]
    async fn test_request_timeout_removes_pending() {
        let token = SessionToken::mint();
        let (isolated, _main) = Bridge::pair(&token);

        // No handler on the peer: the request times out
        let err = isolated
            .request("GET_PERSONA", json!({}), 50)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BridgeTimeout { timeout_ms: 50, .. }));
        assert!(lock(&isolated.shared.pending).is_empty());
    }

    #[tokio::test]
    async fn test_independent_in_flight_requests() {
        let token = SessionToken::mint();
        let (isolated, main) = Bridge::pair(&token);

        main.on_request("ECHO", |data| Ok(data));

        let (a, b) = tokio::join!(
            isolated.request("ECHO", json!(1), 1000),
            isolated.request("ECHO", json!(2), 1000),
        );
        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_ack_round_trip() {
        let token = SessionToken::mint();
        let (isolated, main) = Bridge::pair(&token);

        let waiter = isolated.expect_ack("corr-1");
        main.ack("corr-1", json!({ "surfaces": ["canvas"] }))
            .await
            .unwrap();
        assert!(waiter.wait_on(&isolated, "corr-1", 1000).await);
    }

    #[tokio::test]
    async fn test_ack_timeout_returns_false() {
        let token = SessionToken::mint();
        let (isolated, _main) = Bridge::pair(&token);
        assert!(!isolated.wait_for_ack("never-acked", 50).await);
    }

    #[tokio::test]
    async fn test_early_ack_not_lost() {
        let token = SessionToken::mint();
        let (isolated, main) = Bridge::pair(&token);

        main.ack("early", json!(null)).await.unwrap();
        // Give the dispatcher time to file it
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(isolated.wait_for_ack("early", 50).await);
    }

    #[tokio::test]
    async fn test_event_and_detection_relay() {
        let token = SessionToken::mint();
        let (isolated, main) = Bridge::pair(&token);

        let (seen_tx, mut seen_rx) = mpsc::channel(8);
        let relay_tx = seen_tx.clone();
        isolated.set_detection_relay(move |data| {
            let _ = relay_tx.try_send(("relay", data));
        });
        isolated.on(DETECTION_EVENT, move |data| {
            let _ = seen_tx.try_send(("handler", data));
        });

        main.emit(DETECTION_EVENT, json!({ "category": "canvas" }))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(
                tokio::time::timeout(Duration::from_millis(500), seen_rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert!(seen.iter().any(|(who, _)| *who == "relay"));
        assert!(seen.iter().any(|(who, _)| *who == "handler"));
        for (_, data) in seen {
            assert_eq!(data["category"], "canvas");
        }
    }

    #[tokio::test]
    async fn test_wrong_token_dropped_silently() {
        let token = SessionToken::mint();
        let (to_bridge_tx, to_bridge_rx) = mpsc::channel(8);
        let (from_bridge_tx, mut from_bridge_rx) = mpsc::channel(8);

        let bridge = Bridge::channel(
            World::Isolated,
            World::Main,
            token.clone(),
            from_bridge_tx,
            to_bridge_rx,
        );
        bridge.on_request("GET_PERSONA", |_| Ok(json!({ "id": "p" })));

        // Well-formed envelope, wrong token: no RESPONSE may be produced
        to_bridge_tx
            .send(Posted {
                source: World::Main,
                envelope: Envelope {
                    kind: MsgKind::Request,
                    id: Some("forged".into()),
                    payload: Some(json!({ "request": "GET_PERSONA", "data": {} })),
                    token: "wrong-token".into(),
                },
            })
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_millis(100), from_bridge_rx.recv()).await;
        assert!(reply.is_err(), "forged request must not be answered");

        // Same envelope with the right token is served
        to_bridge_tx
            .send(Posted {
                source: World::Main,
                envelope: Envelope {
                    kind: MsgKind::Request,
                    id: Some("legit".into()),
                    payload: Some(json!({ "request": "GET_PERSONA", "data": {} })),
                    token: token.as_str().to_string(),
                },
            })
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_millis(500), from_bridge_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.kind, MsgKind::Response);
        assert_eq!(reply.envelope.id.as_deref(), Some("legit"));
    }

    #[tokio::test]
    async fn test_wrong_source_dropped() {
        let token = SessionToken::mint();
        let (to_bridge_tx, to_bridge_rx) = mpsc::channel(8);
        let (from_bridge_tx, mut from_bridge_rx) = mpsc::channel(8);

        let bridge = Bridge::channel(
            World::Isolated,
            World::Main,
            token.clone(),
            from_bridge_tx,
            to_bridge_rx,
        );
        bridge.on_request("PING", |_| Ok(json!("pong")));

        // Correct token but claiming to come from ourselves
        to_bridge_tx
            .send(Posted {
                source: World::Isolated,
                envelope: Envelope {
                    kind: MsgKind::Request,
                    id: Some("self".into()),
                    payload: Some(json!({ "request": "PING", "data": {} })),
                    token: token.as_str().to_string(),
                },
            })
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_millis(100), from_bridge_rx.recv()).await;
        assert!(reply.is_err());
    }

    #[tokio::test]
    async fn test_envelope_wire_format() {
        let envelope = Envelope {
            kind: MsgKind::Request,
            id: Some("abc".into()),
            payload: Some(json!({ "request": "GET_PERSONA" })),
            token: "tok".into(),
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "PS_REQUEST");
        assert_eq!(wire["token"], "tok");

        let ack: Envelope =
            serde_json::from_str(r#"{"type":"PS_ACK","id":"x","token":"t"}"#).unwrap();
        assert_eq!(ack.kind, MsgKind::Ack);
        assert!(ack.payload.is_none());
    }

    #[test]
    fn test_tokens_unique() {
        let a = SessionToken::mint();
        let b = SessionToken::mint();
        assert_ne!(a, b);
    }
}
