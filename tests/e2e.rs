//! End-to-end regression suite.
//!
//! Drives the real pairing HTTP server and relay client against live local
//! endpoints (no hardware, no network beyond loopback):
//!
//! - phone → HTTP `/pair` → registry + camera keypair (fresh pairing)
//! - relay server → encrypted envelope → router → handler → sealed reply
//! - identity replay defenses across the relay boundary
//! - reconnect after link loss, and relay-domain changes via stop/start
//!
//! The "relay server" here is a minimal tokio-tungstenite accept loop that
//! records the request path and hands the socket to the test.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use komori::config::keys;
use komori::crypto::{self, KeyPair, Session};
use komori::logger::LogStore;
use komori::paths::Paths;
use komori::relay::{Envelope, RelayConfig};
use komori::{handlers, pairing, Services};

const WAIT: Duration = Duration::from_secs(5);

// ── Harness ──────────────────────────────────────────────────────────

async fn spawn_services(dir: &std::path::Path) -> Arc<Services> {
    let paths = Paths::new(dir);
    let logs = LogStore::open(&paths.logs_file);
    let relay_cfg = RelayConfig {
        reconnect_delay: Duration::from_millis(150),
        // Keep pings out of the frame streams these tests inspect.
        ping_interval: Duration::from_secs(60),
    };
    Services::init_with_relay_config(paths, logs, relay_cfg).unwrap()
}

struct FakeConn {
    path: String,
    ws: WebSocketStream<TcpStream>,
}

/// A relay-server stand-in: accepts WebSocket connections and hands them,
/// with the request path, to the test body.
struct FakeRelay {
    addr: SocketAddr,
    conns: mpsc::Receiver<FakeConn>,
}

impl FakeRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::channel(8);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (path_tx, path_rx) = oneshot::channel();
                    let callback = move |req: &Request, resp: Response| {
                        let _ = path_tx.send(req.uri().to_string());
                        Ok(resp)
                    };
                    if let Ok(ws) =
                        tokio_tungstenite::accept_hdr_async(stream, callback).await
                    {
                        let path = path_rx.await.unwrap_or_default();
                        let _ = tx.send(FakeConn { path, ws }).await;
                    }
                });
            }
        });

        Self { addr, conns }
    }

    fn domain(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn next_conn(&mut self) -> FakeConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("timed out waiting for relay connection")
            .expect("relay accept loop ended")
    }

    async fn expect_no_conn(&mut self) {
        let result = timeout(Duration::from_millis(500), self.conns.recv()).await;
        assert!(result.is_err(), "unexpected relay connection");
    }
}

impl FakeConn {
    async fn send_envelope(&mut self, envelope: &Envelope) {
        let text = serde_json::to_string(envelope).unwrap();
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    /// Next text frame, parsed as an envelope (pings are skipped).
    async fn recv_envelope(&mut self) -> Envelope {
        loop {
            let msg = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for envelope")
                .expect("connection closed")
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(payload) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                _ => {}
            }
        }
    }
}

/// A phone-side identity: keypair plus the session derived after pairing.
struct TestDevice {
    id: &'static str,
    keypair: KeyPair,
    session: Option<Session>,
}

impl TestDevice {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            keypair: KeyPair::generate(),
            session: None,
        }
    }

    /// Pair through the service layer, deriving the shared session the way
    /// the phone app would.
    async fn pair(&mut self, services: &Services) {
        let code = services.pairing.get_code().await;
        let result = services
            .pairing
            .pair(self.id, "Test Phone", &code, &self.keypair.public_bytes())
            .await
            .unwrap();

        let key = crypto::derive_shared_key(
            &self.keypair.private_bytes(),
            &result.camera_public_key,
        )
        .unwrap();
        self.session = Some(Session::from_key(&key));
    }

    fn session(&self) -> &Session {
        self.session.as_ref().expect("device not paired")
    }

    /// Seal a command payload, embedding this device's ID as the router
    /// requires.
    fn seal_command(&self, mut payload: Value) -> String {
        payload["deviceId"] = json!(self.id);
        self.session()
            .seal(payload.to_string().as_bytes())
            .unwrap()
    }

    fn open_reply(&self, envelope: &Envelope) -> Value {
        let plaintext = self.session().open(&envelope.encrypted_payload).unwrap();
        serde_json::from_slice(&plaintext).unwrap()
    }
}

async fn product_id(services: &Services) -> String {
    services.config.get_string(keys::PRODUCT_ID).await.unwrap()
}

// ── Pairing over HTTP ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn fresh_pairing_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let services = spawn_services(dir.path()).await;
    let addr = pairing::http::serve(Arc::clone(&services), 0).await.unwrap();

    let device = KeyPair::generate();
    // The phone hears the code through the room; tests read it directly.
    let code = services.pairing.get_code().await;

    let client = reqwest::Client::new();
    let response: Value = client
        .post(format!("http://127.0.0.1:{}/pair", addr.port()))
        .json(&json!({
            "deviceId": "dev-1",
            "deviceName": "Phone",
            "code": code,
            "devicePublicKey": crypto::encode_public_key(&device.public_bytes()),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["success"], true);
    let camera_public =
        crypto::decode_public_key(response["data"]["cameraPublicKey"].as_str().unwrap()).unwrap();

    // Camera state: device committed, keypair persisted.
    let paired = services.registry.get_by_id("dev-1").await.unwrap();
    assert_eq!(paired.public_key, device.public_bytes());
    let camera_private = services
        .config
        .get_bytes(keys::CAMERA_PRIVATE_KEY)
        .await
        .unwrap();
    assert!(!camera_private.is_empty());

    // Both sides derive the same session key.
    let device_side =
        crypto::derive_shared_key(&device.private_bytes(), &camera_public).unwrap();
    let camera_side =
        crypto::derive_shared_key(&camera_private, &device.public_bytes()).unwrap();
    assert_eq!(device_side, camera_side);

    // The consumed code no longer pairs anyone.
    let replay: Value = client
        .post(format!("http://127.0.0.1:{}/pair", addr.port()))
        .json(&json!({
            "deviceId": "dev-2",
            "deviceName": "Another",
            "code": code,
            "devicePublicKey": crypto::encode_public_key(&KeyPair::generate().public_bytes()),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replay["success"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn pair_rejects_malformed_public_key() {
    let dir = tempfile::tempdir().unwrap();
    let services = spawn_services(dir.path()).await;
    let addr = pairing::http::serve(Arc::clone(&services), 0).await.unwrap();
    let code = services.pairing.get_code().await;

    use base64::Engine;
    let short_key = base64::engine::general_purpose::STANDARD.encode([0x11u8; 31]);

    let response = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/pair", addr.port()))
        .json(&json!({
            "deviceId": "dev-1",
            "deviceName": "Phone",
            "code": code,
            "devicePublicKey": short_key,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
}

// ── Encrypted commands over the relay ────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_command_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let services = spawn_services(dir.path()).await;
    let mut relay = FakeRelay::start().await;

    let mut device = TestDevice::new("dev-1");
    device.pair(&services).await;

    services
        .config
        .set(keys::RELAY_DOMAIN, json!(relay.domain()))
        .await
        .unwrap();
    handlers::register_handlers(&services);
    services.relay.start().await.unwrap();

    let mut conn = relay.next_conn().await;
    let cam_id = product_id(&services).await;
    assert_eq!(conn.path, format!("/ws?product-id={cam_id}"));

    conn.send_envelope(&Envelope {
        msg_type: "getDevices".into(),
        target: Some("product".into()),
        product_id: cam_id.clone(),
        device_id: device.id.into(),
        encrypted_payload: device.seal_command(json!({})),
    })
    .await;

    let reply = conn.recv_envelope().await;
    assert_eq!(reply.msg_type, "getDevicesResult");
    assert_eq!(reply.target.as_deref(), Some("device"));
    assert_eq!(reply.product_id, cam_id);
    assert_eq!(reply.device_id, device.id);

    let payload = device.open_reply(&reply);
    assert_eq!(payload["success"], true);
    assert_eq!(payload["productId"], cam_id.as_str());
    let devices = payload["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["id"], "dev-1");

    services.relay.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_envelope_with_swapped_identity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let services = spawn_services(dir.path()).await;
    let mut relay = FakeRelay::start().await;

    let mut d1 = TestDevice::new("dev-1");
    d1.pair(&services).await;
    let mut d2 = TestDevice::new("dev-2");
    d2.pair(&services).await;

    services
        .config
        .set(keys::RELAY_DOMAIN, json!(relay.domain()))
        .await
        .unwrap();
    handlers::register_handlers(&services);
    services.relay.start().await.unwrap();

    let mut conn = relay.next_conn().await;
    let cam_id = product_id(&services).await;
    let devices_before = services.registry.get_all().await;

    // A captured dev-1 ciphertext resubmitted under dev-2's outer identity:
    // it cannot even be opened with dev-2's key.
    let captured = d1.seal_command(json!({}));
    conn.send_envelope(&Envelope {
        msg_type: "getDevices".into(),
        target: Some("product".into()),
        product_id: cam_id.clone(),
        device_id: "dev-2".into(),
        encrypted_payload: captured,
    })
    .await;

    let reply = conn.recv_envelope().await;
    assert_eq!(reply.msg_type, "getDevicesResult");
    // Authentication failures come back as plain JSON, not ciphertext.
    let body: Value = serde_json::from_str(&reply.encrypted_payload).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Failed to decrypt payload");

    // A ciphertext that does open, but claims a different inner identity,
    // trips the binding check itself.
    let mut forged = json!({});
    forged["deviceId"] = json!("dev-2");
    let sealed_mismatch = d1.session().seal(forged.to_string().as_bytes()).unwrap();
    conn.send_envelope(&Envelope {
        msg_type: "getDevices".into(),
        target: Some("product".into()),
        product_id: cam_id.clone(),
        device_id: "dev-1".into(),
        encrypted_payload: sealed_mismatch,
    })
    .await;

    let reply = conn.recv_envelope().await;
    let body: Value = serde_json::from_str(&reply.encrypted_payload).unwrap();
    assert_eq!(body["error"], "Device ID mismatch");

    // No state changed on either rejection.
    assert_eq!(services.registry.get_all().await, devices_before);

    services.relay.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unpaired_sender_gets_unencrypted_denial() {
    let dir = tempfile::tempdir().unwrap();
    let services = spawn_services(dir.path()).await;
    let mut relay = FakeRelay::start().await;

    services
        .config
        .set(keys::RELAY_DOMAIN, json!(relay.domain()))
        .await
        .unwrap();
    handlers::register_handlers(&services);
    services.relay.start().await.unwrap();

    let mut conn = relay.next_conn().await;
    conn.send_envelope(&Envelope {
        msg_type: "getHealth".into(),
        target: Some("product".into()),
        product_id: product_id(&services).await,
        device_id: "ghost".into(),
        encrypted_payload: "irrelevant".into(),
    })
    .await;

    let reply = conn.recv_envelope().await;
    assert_eq!(reply.msg_type, "getHealthResult");
    let body: Value = serde_json::from_str(&reply.encrypted_payload).unwrap();
    assert_eq!(body["error"], "Device not paired");

    services.relay.stop();
}

// ── Transport resilience ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn relay_reconnects_after_link_drop() {
    let dir = tempfile::tempdir().unwrap();
    let services = spawn_services(dir.path()).await;
    let mut relay = FakeRelay::start().await;

    services
        .config
        .set(keys::RELAY_DOMAIN, json!(relay.domain()))
        .await
        .unwrap();
    services.relay.start().await.unwrap();

    let conn = relay.next_conn().await;
    drop(conn);

    // Once the client notices the dead link, sends fail immediately;
    // nothing is buffered for retry.
    let envelope = Envelope::to_device("xResult", "cam", "dev", "p");
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if services.relay.send(&envelope).await.is_err() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "send kept succeeding after link drop"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The client redials after its backoff.
    let _second = relay.next_conn().await;

    services.relay.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_domain_change_requires_stop_start() {
    let dir = tempfile::tempdir().unwrap();
    let services = spawn_services(dir.path()).await;
    let mut relay_a = FakeRelay::start().await;
    let mut relay_b = FakeRelay::start().await;

    services
        .config
        .set(keys::RELAY_DOMAIN, json!(relay_a.domain()))
        .await
        .unwrap();
    services.relay.start().await.unwrap();
    let _conn_a = relay_a.next_conn().await;

    services.relay.stop();
    services
        .config
        .set(keys::RELAY_DOMAIN, json!(relay_b.domain()))
        .await
        .unwrap();
    services.relay.start().await.unwrap();

    let _conn_b = relay_b.next_conn().await;
    // The old relay never sees another dial after stop().
    relay_a.expect_no_conn().await;

    services.relay.stop();
}
