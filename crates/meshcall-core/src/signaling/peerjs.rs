//! Rendezvous client for a PeerJS signaling server.
//!
//! Frames are JSON objects `{type, src, dst, payload}` carried over a single
//! WebSocket. The server answers registration with `OPEN` (or `ID-TAKEN`),
//! forwards `OFFER`/`ANSWER`/`CANDIDATE`/`LEAVE` between clients and reports
//! undeliverable messages with `EXPIRE`.
//!
//! [`Rendezvous::open`] and [`Rendezvous::reconnect`] resolve only once the
//! server has answered the registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{Rendezvous, RendezvousEvent, RendezvousEvents, Signal};
use crate::config::{MeshConfig, RendezvousEndpoint};
use crate::errors::MeshError;

/// How long the server gets to answer a registration.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Build the WebSocket URL for `endpoint`.
pub fn endpoint_url(
    endpoint: &RendezvousEndpoint,
    id: &str,
    token: &str,
) -> Result<Url, MeshError> {
    let scheme = if endpoint.secure { "wss" } else { "ws" };
    let path = endpoint.path.trim_end_matches('/');
    let mut url = Url::parse(&format!(
        "{scheme}://{}:{}{path}/peerjs",
        endpoint.host, endpoint.port
    ))
    .map_err(|e| MeshError::Config(format!("bad rendezvous endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("key", &endpoint.key)
        .append_pair("id", id)
        .append_pair("token", token);
    Ok(url)
}

fn encode_signal(src: &str, dst: &str, signal: &Signal) -> String {
    let (kind, payload) = match signal {
        Signal::Offer { connection_id, sdp } => (
            "OFFER",
            Some(json!({
                "sdp": { "type": "offer", "sdp": sdp },
                "type": "media",
                "connectionId": connection_id,
            })),
        ),
        Signal::Answer { connection_id, sdp } => (
            "ANSWER",
            Some(json!({
                "sdp": { "type": "answer", "sdp": sdp },
                "type": "media",
                "connectionId": connection_id,
            })),
        ),
        Signal::Candidate {
            connection_id,
            candidate,
        } => (
            "CANDIDATE",
            Some(json!({
                "candidate": { "candidate": candidate },
                "type": "media",
                "connectionId": connection_id,
            })),
        ),
        Signal::Leave => ("LEAVE", None),
    };
    let frame = Frame {
        kind: kind.to_string(),
        src: Some(src.to_string()),
        dst: Some(dst.to_string()),
        payload,
    };
    // A struct of strings and JSON values always serializes.
    serde_json::to_string(&frame).unwrap_or_default()
}

fn heartbeat_frame() -> String {
    json!({ "type": "HEARTBEAT" }).to_string()
}

fn payload_str<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload.pointer(pointer).and_then(Value::as_str)
}

/// Translate one server frame. Frames we do not care about yield `None`.
fn decode_frame(text: &str) -> Option<RendezvousEvent> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("peerjs: unparseable frame: {e}");
            return None;
        }
    };
    let src = frame.src.unwrap_or_default();
    let payload = frame.payload.unwrap_or(Value::Null);
    let connection_id = payload_str(&payload, "/connectionId").map(str::to_string);

    match frame.kind.as_str() {
        "OPEN" => Some(RendezvousEvent::Open),
        "ID-TAKEN" => Some(RendezvousEvent::Error(
            payload_str(&payload, "/msg")
                .unwrap_or("id is taken")
                .to_string(),
        )),
        "ERROR" => Some(RendezvousEvent::Error(
            payload_str(&payload, "/msg")
                .unwrap_or("server error")
                .to_string(),
        )),
        "EXPIRE" => Some(RendezvousEvent::Error(format!(
            "message to {src} expired"
        ))),
        "LEAVE" => Some(RendezvousEvent::Signal {
            from: src,
            signal: Signal::Leave,
        }),
        "OFFER" => Some(RendezvousEvent::Signal {
            from: src,
            signal: Signal::Offer {
                connection_id: connection_id?,
                sdp: payload_str(&payload, "/sdp/sdp")?.to_string(),
            },
        }),
        "ANSWER" => Some(RendezvousEvent::Signal {
            from: src,
            signal: Signal::Answer {
                connection_id: connection_id?,
                sdp: payload_str(&payload, "/sdp/sdp")?.to_string(),
            },
        }),
        "CANDIDATE" => Some(RendezvousEvent::Signal {
            from: src,
            signal: Signal::Candidate {
                connection_id: connection_id?,
                candidate: payload_str(&payload, "/candidate/candidate")?.to_string(),
            },
        }),
        other => {
            tracing::debug!("peerjs: ignoring frame type {other}");
            None
        }
    }
}

/// Outcome of the registration handshake, as seen by the reader.
type Registered = oneshot::Sender<Result<(), String>>;

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Registration {
    wire_id: String,
    token: String,
    events: mpsc::UnboundedSender<RendezvousEvent>,
}

/// [`Rendezvous`] over a PeerJS server WebSocket.
pub struct PeerJsRendezvous {
    endpoints: Vec<RendezvousEndpoint>,
    heartbeat: Duration,
    registration: Mutex<Option<Registration>>,
    connection: Mutex<Option<Connection>>,
    closing: Arc<AtomicBool>,
}

impl PeerJsRendezvous {
    pub fn new(endpoints: Vec<RendezvousEndpoint>, heartbeat: Duration) -> Self {
        Self {
            endpoints,
            heartbeat: heartbeat.max(MIN_HEARTBEAT),
            registration: Mutex::new(None),
            connection: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Client for the configured endpoints and heartbeat interval.
    pub fn from_config(config: &MeshConfig) -> Result<Self, MeshError> {
        config.validate()?;
        Ok(Self::new(
            config.rendezvous.clone(),
            config.heartbeat_interval(),
        ))
    }

    /// Register with the first endpoint that accepts the socket.
    ///
    /// Endpoints that cannot be reached or never answer are skipped. A refusal
    /// (`ID-TAKEN`, `ERROR`) ends the search: the id would be refused anywhere.
    async fn connect(
        &self,
        wire_id: &str,
        token: &str,
        events: &mpsc::UnboundedSender<RendezvousEvent>,
    ) -> Result<Connection, MeshError> {
        let mut last_error = MeshError::Config("no rendezvous endpoint configured".into());
        for endpoint in &self.endpoints {
            let url = endpoint_url(endpoint, wire_id, token)?;
            tracing::info!("peerjs: connecting to {}:{}", endpoint.host, endpoint.port);
            let socket = match tokio_tungstenite::connect_async(url.to_string()).await {
                Ok((socket, _)) => socket,
                Err(e) => {
                    tracing::warn!(
                        "peerjs: endpoint {}:{} unavailable: {e}",
                        endpoint.host,
                        endpoint.port
                    );
                    last_error = MeshError::TransportDisconnected(e.to_string());
                    continue;
                }
            };

            let (registered_tx, registered_rx) = oneshot::channel();
            let connection = self.spawn_connection(socket, events.clone(), registered_tx);
            match tokio::time::timeout(REGISTRATION_TIMEOUT, registered_rx).await {
                Ok(Ok(Ok(()))) => {
                    tracing::info!("peerjs: registered {wire_id}");
                    return Ok(connection);
                }
                Ok(Ok(Err(reason))) => {
                    connection.shutdown();
                    tracing::error!("peerjs: registration of {wire_id} refused: {reason}");
                    return Err(MeshError::Signaling(format!(
                        "registration refused: {reason}"
                    )));
                }
                Ok(Err(_)) => {
                    connection.shutdown();
                    last_error =
                        MeshError::TransportDisconnected("socket closed before registration".into());
                }
                Err(_) => {
                    connection.shutdown();
                    last_error =
                        MeshError::TransportDisconnected("no answer to registration".into());
                }
            }
            tracing::warn!(
                "peerjs: endpoint {}:{} failed to register: {last_error}",
                endpoint.host,
                endpoint.port
            );
        }
        Err(last_error)
    }

    fn spawn_connection<S>(
        &self,
        socket: S,
        events: mpsc::UnboundedSender<RendezvousEvent>,
        registered: Registered,
    ) -> Connection
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::warn!("peerjs: write failed: {e}");
                    break;
                }
            }
        });

        let closing = self.closing.clone();
        let reader = tokio::spawn(async move {
            let mut registered = Some(registered);
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let Some(event) = decode_frame(&text) else {
                            continue;
                        };
                        match (registered.take(), event) {
                            (Some(ack), RendezvousEvent::Open) => {
                                let _ = ack.send(Ok(()));
                                if events.send(RendezvousEvent::Open).is_err() {
                                    return;
                                }
                            }
                            (Some(ack), RendezvousEvent::Error(reason)) => {
                                let _ = ack.send(Err(reason));
                                return;
                            }
                            (pending, event) => {
                                registered = pending;
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "socket ended".to_string(),
                }
            };
            // Still registering: dropping the ack tells `connect` to move on.
            if registered.is_some() {
                tracing::debug!("peerjs: socket ended before registration: {reason}");
                return;
            }
            if !closing.load(Ordering::SeqCst) {
                tracing::warn!("peerjs: disconnected: {reason}");
                let _ = events.send(RendezvousEvent::Disconnected(reason));
            }
        });

        let heartbeat_tx = outbound.clone();
        let interval = self.heartbeat;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(Message::Text(heartbeat_frame())).is_err() {
                    break;
                }
            }
        });

        Connection {
            outbound,
            tasks: vec![writer, reader, heartbeat],
        }
    }
}

#[async_trait]
impl Rendezvous for PeerJsRendezvous {
    async fn open(&self, wire_id: &str) -> Result<RendezvousEvents, MeshError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.closing.store(false, Ordering::SeqCst);
        let connection = self.connect(wire_id, &token, &events_tx).await?;
        if let Some(old) = self.connection.lock().await.replace(connection) {
            old.shutdown();
        }
        *self.registration.lock().await = Some(Registration {
            wire_id: wire_id.to_string(),
            token,
            events: events_tx,
        });
        Ok(events_rx)
    }

    async fn send(&self, to: &str, signal: Signal) -> Result<(), MeshError> {
        let src = self
            .registration
            .lock()
            .await
            .as_ref()
            .map(|r| r.wire_id.clone())
            .ok_or_else(|| MeshError::Signaling("not registered".into()))?;
        let connection = self.connection.lock().await;
        let connection = connection
            .as_ref()
            .ok_or_else(|| MeshError::TransportDisconnected("no relay connection".into()))?;
        connection
            .outbound
            .send(Message::Text(encode_signal(&src, to, &signal)))
            .map_err(|_| MeshError::TransportDisconnected("relay socket closed".into()))
    }

    async fn reconnect(&self) -> Result<(), MeshError> {
        let (wire_id, token, events) = {
            let registration = self.registration.lock().await;
            let r = registration
                .as_ref()
                .ok_or_else(|| MeshError::Signaling("not registered".into()))?;
            (r.wire_id.clone(), r.token.clone(), r.events.clone())
        };
        if let Some(old) = self.connection.lock().await.take() {
            old.shutdown();
        }
        let connection = self.connect(&wire_id, &token, &events).await?;
        *self.connection.lock().await = Some(connection);
        Ok(())
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(connection) = self.connection.lock().await.take() {
            let _ = connection.outbound.send(Message::Close(None));
            // Give the writer a moment to flush the close frame.
            tokio::time::sleep(Duration::from_millis(50)).await;
            connection.shutdown();
        }
        self.registration.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackNetwork;
    use crate::events::EventEmitter;
    use crate::ids::{PeerId, RoomId, SessionContext};
    use crate::media::{DeviceTrack, LocalMediaHandle, SyntheticDevices};
    use crate::mesh::{MeshCoordinator, MeshDeps};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::WebSocketStream;

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Local WebSocket server handing each accepted socket, with its request
    /// URI, to the test.
    async fn relay_server() -> (
        RendezvousEndpoint,
        mpsc::UnboundedReceiver<(String, ServerSocket)>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut uri = String::new();
                let accepted = tokio_tungstenite::accept_hdr_async(
                    stream,
                    |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        uri = request.uri().to_string();
                        Ok(response)
                    },
                )
                .await;
                match accepted {
                    Ok(socket) => {
                        if tx.send((uri, socket)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!("test relay handshake failed: {e}"),
                }
            }
        });
        let endpoint = RendezvousEndpoint {
            host: "127.0.0.1".into(),
            port,
            path: "/".into(),
            key: "peerjs".into(),
            secure: false,
        };
        (endpoint, rx)
    }

    async fn reply(socket: &mut ServerSocket, frame: &str) {
        socket.send(Message::Text(frame.to_string())).await.unwrap();
    }

    /// Next frame from the client, skipping heartbeats.
    async fn next_frame(socket: &mut ServerSocket) -> Value {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] != "HEARTBEAT" {
                        return value;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("client socket ended: {other:?}"),
            }
        }
    }

    /// Accept the next client and answer its registration with `frame`.
    async fn answer_registration(
        accepted: &mut mpsc::UnboundedReceiver<(String, ServerSocket)>,
        frame: &str,
    ) -> (String, ServerSocket) {
        let (uri, mut socket) = accepted.recv().await.unwrap();
        reply(&mut socket, frame).await;
        (uri, socket)
    }

    fn token_of(uri: &str) -> Option<&str> {
        uri.split(['?', '&']).find_map(|pair| pair.strip_prefix("token="))
    }

    #[test]
    fn url_carries_key_id_and_token() {
        let endpoint = RendezvousEndpoint {
            host: "relay.example".into(),
            port: 443,
            path: "/peerjs/".into(),
            key: "peerjs".into(),
            secure: true,
        };
        let url = endpoint_url(&endpoint, "alice_r1", "tok").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://relay.example/peerjs/peerjs?key=peerjs&id=alice_r1&token=tok"
        );
    }

    #[test]
    fn offer_frame_matches_peerjs_layout() {
        let text = encode_signal(
            "a_r",
            "b_r",
            &Signal::Offer {
                connection_id: "mc_1".into(),
                sdp: "v=0".into(),
            },
        );
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "OFFER");
        assert_eq!(value["dst"], "b_r");
        assert_eq!(value["payload"]["sdp"]["sdp"], "v=0");
        assert_eq!(value["payload"]["connectionId"], "mc_1");
    }

    #[test]
    fn decodes_inbound_offer() {
        let event = decode_frame(
            r#"{"type":"OFFER","src":"b_r","dst":"a_r","payload":{"sdp":{"type":"offer","sdp":"v=0"},"type":"media","connectionId":"mc_9"}}"#,
        );
        assert_eq!(
            event,
            Some(RendezvousEvent::Signal {
                from: "b_r".into(),
                signal: Signal::Offer {
                    connection_id: "mc_9".into(),
                    sdp: "v=0".into()
                }
            })
        );
    }

    #[test]
    fn decodes_control_frames() {
        assert_eq!(decode_frame(r#"{"type":"OPEN"}"#), Some(RendezvousEvent::Open));
        assert!(matches!(
            decode_frame(r#"{"type":"ID-TAKEN","payload":{"msg":"ID is taken"}}"#),
            Some(RendezvousEvent::Error(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"EXPIRE","src":"c_r"}"#),
            Some(RendezvousEvent::Error(msg)) if msg.contains("c_r")
        ));
        assert_eq!(decode_frame(r#"{"type":"HEARTBEAT"}"#), None);
        assert_eq!(decode_frame("garbage"), None);
    }

    #[test]
    fn candidate_without_connection_id_is_dropped() {
        assert_eq!(
            decode_frame(r#"{"type":"CANDIDATE","src":"b_r","payload":{"candidate":{"candidate":"c"}}}"#),
            None
        );
    }

    #[test]
    fn from_config_rejects_zero_heartbeat() {
        let config = MeshConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            PeerJsRendezvous::from_config(&config),
            Err(MeshError::Config(_))
        ));
        assert!(PeerJsRendezvous::from_config(&MeshConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn registers_and_relays_signals() {
        let (endpoint, mut accepted) = relay_server().await;
        let client = PeerJsRendezvous::new(vec![endpoint], Duration::from_secs(30));
        let (opened, (uri, mut socket)) = tokio::join!(
            client.open("a_r1"),
            answer_registration(&mut accepted, r#"{"type":"OPEN"}"#)
        );
        let mut events = opened.unwrap();
        assert!(uri.starts_with("/peerjs?key=peerjs&id=a_r1&token="));
        assert_eq!(events.recv().await, Some(RendezvousEvent::Open));

        client
            .send(
                "b_r1",
                Signal::Offer {
                    connection_id: "mc_1".into(),
                    sdp: "v=0".into(),
                },
            )
            .await
            .unwrap();
        let frame = next_frame(&mut socket).await;
        assert_eq!(frame["type"], "OFFER");
        assert_eq!(frame["src"], "a_r1");
        assert_eq!(frame["dst"], "b_r1");
        assert_eq!(frame["payload"]["connectionId"], "mc_1");

        reply(
            &mut socket,
            r#"{"type":"ANSWER","src":"b_r1","dst":"a_r1","payload":{"sdp":{"type":"answer","sdp":"v=1"},"type":"media","connectionId":"mc_1"}}"#,
        )
        .await;
        assert_eq!(
            events.recv().await,
            Some(RendezvousEvent::Signal {
                from: "b_r1".into(),
                signal: Signal::Answer {
                    connection_id: "mc_1".into(),
                    sdp: "v=1".into(),
                },
            })
        );

        // A deliberate close reports no disconnect and ends the stream.
        client.close().await;
        assert_eq!(events.recv().await, None);
        assert!(matches!(
            socket.next().await,
            Some(Ok(Message::Close(_))) | None
        ));
    }

    #[tokio::test]
    async fn dropped_socket_reports_disconnect_and_reconnects_with_same_token() {
        let (endpoint, mut accepted) = relay_server().await;
        let client = PeerJsRendezvous::new(vec![endpoint], Duration::from_secs(30));
        let (opened, (first_uri, mut socket)) = tokio::join!(
            client.open("a_r1"),
            answer_registration(&mut accepted, r#"{"type":"OPEN"}"#)
        );
        let mut events = opened.unwrap();
        assert_eq!(events.recv().await, Some(RendezvousEvent::Open));

        socket.close(None).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(RendezvousEvent::Disconnected(_))
        ));

        let (reconnected, (second_uri, _socket)) = tokio::join!(
            client.reconnect(),
            answer_registration(&mut accepted, r#"{"type":"OPEN"}"#)
        );
        reconnected.unwrap();
        assert!(token_of(&first_uri).is_some());
        assert_eq!(token_of(&first_uri), token_of(&second_uri));
        assert_eq!(events.recv().await, Some(RendezvousEvent::Open));
        client.close().await;
    }

    #[tokio::test]
    async fn taken_id_fails_open() {
        let (endpoint, mut accepted) = relay_server().await;
        let client = PeerJsRendezvous::new(vec![endpoint], Duration::from_secs(30));
        let (opened, _socket) = tokio::join!(
            client.open("a_r1"),
            answer_registration(
                &mut accepted,
                r#"{"type":"ID-TAKEN","payload":{"msg":"ID \"a_r1\" is taken"}}"#
            )
        );
        assert!(matches!(
            opened,
            Err(MeshError::Signaling(msg)) if msg.contains("is taken")
        ));
        assert!(matches!(
            client.send("b_r1", Signal::Leave).await,
            Err(MeshError::Signaling(_))
        ));
    }

    #[tokio::test]
    async fn refused_registration_fails_mesh_start() {
        let (endpoint, mut accepted) = relay_server().await;
        let devices = SyntheticDevices::new();
        let config = MeshConfig {
            rendezvous: vec![endpoint.clone()],
            ..Default::default()
        };
        let local = LocalMediaHandle::acquire(
            &devices,
            &config.media,
            config.media_acquire_timeout(),
        )
        .await
        .unwrap();
        let deps = MeshDeps {
            rendezvous: Arc::new(PeerJsRendezvous::from_config(&config).unwrap()),
            engine: Arc::new(LoopbackNetwork::new().engine()),
        };
        let ctx = SessionContext::new(RoomId::new("r1"), PeerId::new("a"));

        let (started, _socket) = tokio::join!(
            MeshCoordinator::start(local, ctx, config, deps, EventEmitter::new()),
            answer_registration(&mut accepted, r#"{"type":"ID-TAKEN"}"#)
        );
        assert!(matches!(started, Err(MeshError::Signaling(_))));
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_skipped() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_endpoint = RendezvousEndpoint {
            host: "127.0.0.1".into(),
            port: dead.local_addr().unwrap().port(),
            ..Default::default()
        };
        drop(dead);
        let (endpoint, mut accepted) = relay_server().await;
        let client = PeerJsRendezvous::new(vec![dead_endpoint, endpoint], Duration::from_secs(30));

        let (opened, _socket) = tokio::join!(
            client.open("a_r1"),
            answer_registration(&mut accepted, r#"{"type":"OPEN"}"#)
        );
        assert!(opened.is_ok());
        client.close().await;
    }

    #[tokio::test]
    async fn zero_heartbeat_still_beats() {
        let (endpoint, mut accepted) = relay_server().await;
        let client = PeerJsRendezvous::new(vec![endpoint], Duration::ZERO);
        let (opened, (_, mut socket)) = tokio::join!(
            client.open("a_r1"),
            answer_registration(&mut accepted, r#"{"type":"OPEN"}"#)
        );
        let _events = opened.unwrap();

        let beat = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) if text.contains("HEARTBEAT") => return,
                    Some(Ok(_)) => {}
                    other => panic!("client socket ended: {other:?}"),
                }
            }
        })
        .await;
        assert!(beat.is_ok(), "no heartbeat received");
        client.close().await;
    }
}
