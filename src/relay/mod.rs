//! Relay client: a persistent WebSocket connection to the relay server.
//!
//! One connection at a time, authenticated by the product ID in the URL.
//! The read loop dispatches each inbound envelope to its registered handler
//! in a fresh task so a slow handler never stalls the socket; all outbound
//! frames (handler replies, stream chunks, keep-alive pings) funnel through
//! a single writer task so transport writes are serialized. A dropped
//! connection is redialed after a fixed delay until `stop()`.

mod envelope;

pub use envelope::{relay_url, Envelope, TARGET_DEVICE, TARGET_PRODUCT};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{keys, ConfigStore};
use crate::error::{Error, Result};

pub type HandlerFn = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Transport timing knobs. Production uses the defaults; tests compress them.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct RunState {
    running: bool,
    cancel: Option<CancellationToken>,
    writer: Option<mpsc::Sender<Message>>,
}

/// Cheaply cloneable handle to the relay client.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<RelayInner>,
}

type DisconnectFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct RelayInner {
    config_store: Arc<ConfigStore>,
    cfg: RelayConfig,
    /// Message-type -> handler. Filled once at startup, read-only afterwards.
    handlers: RwLock<HashMap<String, HandlerFn>>,
    /// Invoked whenever an open connection ends, however it ends.
    on_disconnect: RwLock<Option<DisconnectFn>>,
    state: Mutex<RunState>,
}

impl RelayClient {
    pub fn new(config_store: Arc<ConfigStore>) -> Self {
        Self::with_config(config_store, RelayConfig::default())
    }

    pub fn with_config(config_store: Arc<ConfigStore>, cfg: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config_store,
                cfg,
                handlers: RwLock::new(HashMap::new()),
                on_disconnect: RwLock::new(None),
                state: Mutex::new(RunState::default()),
            }),
        }
    }

    /// Register a handler for an inbound envelope type.
    pub fn on<F, Fut>(&self, msg_type: &str, handler: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |env| Box::pin(handler(env)));
        self.inner
            .handlers
            .write()
            .expect("handler registry poisoned")
            .insert(msg_type.to_string(), handler);
    }

    /// Register a callback fired every time an open connection ends, so
    /// connection-scoped state (live viewers) can be torn down.
    pub fn on_disconnect<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: DisconnectFn = Arc::new(move || Box::pin(hook()));
        *self
            .inner
            .on_disconnect
            .write()
            .expect("disconnect hook poisoned") = Some(hook);
    }

    /// Connect to the relay and keep the connection alive until `stop()`.
    ///
    /// The relay domain and product ID are read once here; changing the
    /// domain requires a `stop()` + `start()` cycle.
    pub async fn start(&self) -> Result<()> {
        let domain = self
            .inner
            .config_store
            .get_string(keys::RELAY_DOMAIN)
            .await
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Config("relay domain not configured".into()))?;
        let product_id = self
            .inner
            .config_store
            .get_string(keys::PRODUCT_ID)
            .await
            .ok_or_else(|| Error::Config("camera ID not found".into()))?;

        let cancel = {
            let mut state = self.inner.state.lock().expect("relay state poisoned");
            if state.running {
                return Err(Error::Subsystem("relay already running".into()));
            }
            let cancel = CancellationToken::new();
            state.running = true;
            state.cancel = Some(cancel.clone());
            cancel
        };

        let url = relay_url(&domain, &product_id);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run(url, cancel).await;
        });
        Ok(())
    }

    /// Close the connection and terminate the reconnect loop.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().expect("relay state poisoned");
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.writer = None;
        state.running = false;
    }

    /// Send an envelope. Fails with `NotConnected` while the link is down;
    /// nothing is queued for retry.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = serde_json::to_string(envelope)?;
        let writer = {
            let state = self.inner.state.lock().expect("relay state poisoned");
            state.writer.clone().ok_or(Error::NotConnected)?
        };
        writer
            .send(Message::Text(text))
            .await
            .map_err(|_| Error::NotConnected)
    }
}

impl RelayInner {
    async fn run(self: Arc<Self>, url: String, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match connect_async(&url).await {
                Ok((ws, _)) => {
                    info!("relay connected");
                    self.serve_connection(ws, &cancel).await;
                    if !cancel.is_cancelled() {
                        warn!("relay connection lost, reconnecting");
                    }
                }
                Err(e) => {
                    debug!("relay dial failed: {e}");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.reconnect_delay) => {}
            }
        }
        debug!("relay loop terminated");
    }

    async fn serve_connection<S>(&self, ws: S, cancel: &CancellationToken)
    where
        S: futures_util::Stream<Item = tokio_tungstenite::tungstenite::Result<Message>>
            + futures_util::Sink<Message>
            + Unpin
            + Send
            + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(64);
        let conn_cancel = cancel.child_token();

        // Single writer task: the transport admits one frame writer at a time.
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Keep-alive ticker. A failed ping send is not itself a state
        // transition; the read loop notices the dead socket.
        let ping_tx = tx.clone();
        let ping_cancel = conn_cancel.clone();
        let ping_interval = self.cfg.ping_interval;
        let ping_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ping_cancel.cancelled() => break,
                    _ = tokio::time::sleep(ping_interval) => {
                        if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.install_writer(tx.clone());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("relay read error: {e}");
                        break;
                    }
                }
            }
        }

        self.clear_writer(&tx);
        conn_cancel.cancel();
        drop(tx);
        ping_task.abort();
        let _ = writer_task.await;

        let hook = self
            .on_disconnect
            .read()
            .expect("disconnect hook poisoned")
            .clone();
        if let Some(hook) = hook {
            tokio::spawn(hook());
        }
    }

    /// Deliver an inbound frame to its handler, each in its own task so one
    /// handler cannot block the read loop. Delivery order follows receipt
    /// order; completion order is unspecified.
    fn dispatch(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                debug!("ignoring malformed relay frame: {e}");
                return;
            }
        };

        let handler = {
            let handlers = self.handlers.read().expect("handler registry poisoned");
            handlers.get(&envelope.msg_type).cloned()
        };

        match handler {
            Some(handler) => {
                tokio::spawn(handler(envelope));
            }
            None => debug!(msg_type = %envelope.msg_type, "no handler for relay message"),
        }
    }

    fn install_writer(&self, tx: mpsc::Sender<Message>) {
        let mut state = self.state.lock().expect("relay state poisoned");
        // stop() may have raced us; never resurrect a writer after stop.
        if state.running {
            state.writer = Some(tx);
        }
    }

    /// Clear the writer only if it is still ours; a stop()+start() cycle
    /// may already have installed a newer connection's writer.
    fn clear_writer(&self, tx: &mpsc::Sender<Message>) {
        let mut state = self.state.lock().expect("relay state poisoned");
        if state.writer.as_ref().is_some_and(|w| w.same_channel(tx)) {
            state.writer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn client_with_domain(domain: Option<&str>) -> (tempfile::TempDir, RelayClient) {
        let dir = tempdir().unwrap();
        let config = Arc::new(ConfigStore::load(dir.path().join("config.json")).unwrap());
        if let Some(domain) = domain {
            config
                .set(keys::RELAY_DOMAIN, serde_json::Value::String(domain.into()))
                .await
                .unwrap();
        }
        (dir, RelayClient::new(config))
    }

    #[tokio::test]
    async fn send_without_connection_is_not_connected() {
        let (_dir, client) = client_with_domain(Some("relay.example")).await;
        let env = Envelope::to_device("xResult", "cam", "dev", "p");
        assert!(matches!(client.send(&env).await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn start_requires_relay_domain() {
        let (_dir, client) = client_with_domain(None).await;
        assert!(matches!(client.start().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (_dir, client) = client_with_domain(Some("relay.invalid")).await;
        client.start().await.unwrap();
        assert!(client.start().await.is_err());
        client.stop();
    }

    #[tokio::test]
    async fn stop_then_start_is_allowed() {
        let (_dir, client) = client_with_domain(Some("relay.invalid")).await;
        client.start().await.unwrap();
        client.stop();
        client.start().await.unwrap();
        client.stop();
    }
}
