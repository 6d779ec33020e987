//! Persistent Socket.IO channel to the forum.
//!
//! One supervisor task owns the WebSocket. It reconnects forever with
//! randomized exponential backoff, answers engine pings, dispatches server
//! events to registered handlers and resolves acknowledgements of
//! outstanding calls. Callers only ever see [`RealtimeChannel::call`], which
//! waits for a connection, retries transient failures and gives up after a
//! bounded number of trials.

pub mod backoff;
pub mod packet;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;

use self::backoff::Backoff;
use self::packet::{EnginePacket, SocketPacket};

/// Time allowed for the server to open the session before the socket is
/// considered dead.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Supplies the current session cookies at every (re)connect.
pub type CookieSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Where and how to open the WebSocket.
#[derive(Clone)]
pub struct Endpoint {
    pub url: Url,
    pub origin: String,
    pub user_agent: String,
    pub cookies: CookieSource,
}

impl Endpoint {
    /// `https://forum` becomes `wss://forum/socket.io/?EIO=4&transport=websocket`.
    pub fn for_forum(
        base: &Url,
        user_agent: &str,
        cookies: CookieSource,
    ) -> Result<Self, RealtimeError> {
        let mut url = base.clone();
        let scheme = match base.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(RealtimeError::Transport(format!(
                    "unsupported forum scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::Transport("cannot derive websocket URL".to_string()))?;
        url.set_path("/socket.io/");
        url.set_query(Some("EIO=4&transport=websocket"));

        Ok(Self {
            url,
            origin: base.origin().ascii_serialization(),
            user_agent: user_agent.to_string(),
            cookies,
        })
    }

    fn request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, RealtimeError> {
        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| RealtimeError::Transport(format!("invalid header value: {}", e)))
        };

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(USER_AGENT, header(&self.user_agent)?);
        headers.insert(ORIGIN, header(&self.origin)?);
        if let Some(cookies) = (self.cookies)() {
            headers.insert(COOKIE, header(&cookies)?);
        }
        Ok(request)
    }
}

#[derive(Debug, PartialEq)]
enum FrameOutcome {
    Continue,
    /// Engine session opened; carries the ping liveness window if announced.
    Opened(Option<Duration>),
    Connected,
    Closed,
}

struct Shared {
    config: RealtimeConfig,
    state_tx: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    next_ack: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    closed: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Realtime state {:?} -> {:?}", previous, state);
        }
    }

    /// Drop the writer and every outstanding ack; waiters see `ConnectionLost`.
    fn mark_disconnected(&self) {
        lock(&self.outbound).take();
        let dropped = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            tracing::warn!("Connection lost with {} call(s) awaiting ack", dropped);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_frame(
        &self,
        text: &str,
        out: &mpsc::UnboundedSender<String>,
    ) -> Result<FrameOutcome, RealtimeError> {
        match packet::parse_engine(text)? {
            EnginePacket::Open(payload) => {
                let _ = out.send(packet::encode_connect());
                let interval = payload.get("pingInterval").and_then(Value::as_u64);
                let timeout = payload.get("pingTimeout").and_then(Value::as_u64);
                let liveness = match (interval, timeout) {
                    (Some(interval), Some(timeout)) => {
                        Some(Duration::from_millis(interval + timeout))
                    }
                    _ => None,
                };
                Ok(FrameOutcome::Opened(liveness))
            }
            EnginePacket::Ping(data) => {
                let _ = out.send(packet::encode_pong(&data));
                Ok(FrameOutcome::Continue)
            }
            EnginePacket::Close => Ok(FrameOutcome::Closed),
            EnginePacket::Message(body) => self.handle_socket(&body, out),
            EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {
                Ok(FrameOutcome::Continue)
            }
        }
    }

    fn handle_socket(
        &self,
        body: &str,
        out: &mpsc::UnboundedSender<String>,
    ) -> Result<FrameOutcome, RealtimeError> {
        match packet::parse_socket(body)? {
            SocketPacket::Connect(_) => {
                *lock(&self.outbound) = Some(out.clone());
                self.set_state(ConnectionState::Connected);
                Ok(FrameOutcome::Connected)
            }
            SocketPacket::Disconnect => Ok(FrameOutcome::Closed),
            SocketPacket::Event { name, args, .. } => {
                self.dispatch(&name, &args);
                Ok(FrameOutcome::Continue)
            }
            SocketPacket::Ack { ack_id, args } => {
                match lock(&self.pending).remove(&ack_id) {
                    Some(waiter) => {
                        let _ = waiter.send(args);
                    }
                    None => tracing::debug!("Ignoring ack {} with no waiting call", ack_id),
                }
                Ok(FrameOutcome::Continue)
            }
            SocketPacket::ConnectError(payload) => Err(RealtimeError::Transport(format!(
                "server refused the connection: {}",
                payload
            ))),
        }
    }

    fn dispatch(&self, name: &str, args: &[Value]) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            tracing::debug!("Unhandled realtime event '{}'", name);
        }
        for handler in handlers {
            handler(args);
        }
    }
}

/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<Shared>,
}

impl RealtimeChannel {
    pub fn new(config: RealtimeConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                state_tx,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_ack: AtomicU64::new(0),
                handlers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Register a handler for a server-pushed event. Handlers run on the
    /// receive task and must not block.
    pub fn on_event(&self, name: &str, handler: EventHandler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_default()
            .push(handler);
    }

    /// Start the supervisor. Returns immediately; the connection comes up in
    /// the background and is re-established forever until [`shutdown`].
    ///
    /// [`shutdown`]: RealtimeChannel::shutdown
    pub fn connect(&self, endpoint: Endpoint) {
        let mut supervisor = lock(&self.shared.supervisor);
        if supervisor.is_some() {
            tracing::warn!("Realtime channel already started");
            return;
        }
        let shared = self.shared.clone();
        *supervisor = Some(tokio::spawn(supervise(shared, endpoint)));
    }

    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.shared.supervisor).take() {
            handle.abort();
        }
        self.shared.mark_disconnected();
    }

    pub async fn wait_connected(&self) -> Result<(), RealtimeError> {
        let mut state = self.shared.state_tx.subscribe();
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(RealtimeError::Closed);
            }
            if *state.borrow_and_update() == ConnectionState::Connected {
                return Ok(());
            }
            if state.changed().await.is_err() {
                return Err(RealtimeError::Closed);
            }
        }
    }

    /// Remote call with acknowledgement, retried on transient failures.
    ///
    /// Remote errors such as "method error" or rate limiting, ack timeouts
    /// and dropped connections are retried after a fixed delay, up to the
    /// configured number of trials. Anything else is returned immediately.
    pub async fn call(&self, event: &str, payload: Value) -> Result<Value, RealtimeError> {
        let trials = self.shared.config.call_trials.max(1);
        let mut trial = 1;
        loop {
            match self.call_once(event, &payload).await {
                Ok(value) => {
                    let spacing = self.shared.config.call_spacing();
                    if !spacing.is_zero() {
                        tokio::time::sleep(spacing).await;
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && trial < trials => {
                    tracing::warn!(
                        "Realtime call '{}' failed (trial {}/{}): {}",
                        event,
                        trial,
                        trials,
                        e
                    );
                    tokio::time::sleep(self.shared.config.call_retry_delay()).await;
                    trial += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(RealtimeError::CallFailed {
                        event: event.to_string(),
                        trials: trial,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, event: &str, payload: &Value) -> Result<Value, RealtimeError> {
        self.wait_connected().await?;

        let ack_id = self.shared.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(ack_id, tx);

        let frame = packet::encode_event(event, payload, Some(ack_id));
        let sent = lock(&self.shared.outbound)
            .as_ref()
            .map(|out| out.send(frame).is_ok())
            .unwrap_or(false);
        if !sent {
            lock(&self.shared.pending).remove(&ack_id);
            return Err(RealtimeError::ConnectionLost);
        }

        match tokio::time::timeout(self.shared.config.ack_timeout(), rx).await {
            Err(_) => {
                lock(&self.shared.pending).remove(&ack_id);
                Err(RealtimeError::AckTimeout(event.to_string()))
            }
            Ok(Err(_)) => Err(RealtimeError::ConnectionLost),
            Ok(Ok(args)) => interpret_ack(args),
        }
    }

    #[cfg(test)]
    fn loopback(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .handle_frame(r#"0{"sid":"test","pingInterval":25000,"pingTimeout":20000}"#, &tx)
            .unwrap();
        self.shared.handle_frame("40", &tx).unwrap();
        rx
    }

    #[cfg(test)]
    fn inject(&self, text: &str) -> Result<FrameOutcome, RealtimeError> {
        let out = lock(&self.shared.outbound)
            .clone()
            .unwrap_or_else(|| mpsc::unbounded_channel().0);
        self.shared.handle_frame(text, &out)
    }
}

/// NodeBB acks with `[err, result]`.
fn interpret_ack(mut args: Vec<Value>) -> Result<Value, RealtimeError> {
    let err = if args.is_empty() {
        Value::Null
    } else {
        args.remove(0)
    };
    if !err.is_null() {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| err.as_str().map(str::to_string))
            .unwrap_or_else(|| err.to_string());
        return Err(RealtimeError::Remote(message));
    }
    Ok(if args.is_empty() {
        Value::Null
    } else {
        args.remove(0)
    })
}

async fn supervise(shared: Arc<Shared>, endpoint: Endpoint) {
    let config = shared.config.clone();
    let mut backoff = Backoff::new(
        Duration::from_secs(config.reconnect_delay_secs),
        Duration::from_secs(config.reconnect_delay_max_secs),
        config.randomization_factor,
    );

    while !shared.closed.load(Ordering::SeqCst) {
        shared.set_state(ConnectionState::Connecting);
        match run_session(&shared, &endpoint, &mut backoff).await {
            Ok(()) => tracing::warn!("Websocket disconnected by server"),
            Err(e) => tracing::warn!("Websocket connection failed: {}", e),
        }
        shared.mark_disconnected();

        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        let delay = backoff.next_delay();
        tracing::info!(
            "Reconnecting websocket in {:.1}s (attempt {})",
            delay.as_secs_f64(),
            backoff.attempt()
        );
        tokio::time::sleep(delay).await;
    }
}

async fn run_session(
    shared: &Arc<Shared>,
    endpoint: &Endpoint,
    backoff: &mut Backoff,
) -> Result<(), RealtimeError> {
    let request = endpoint.request()?;
    tracing::debug!("Opening websocket to {}", endpoint.url);
    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| RealtimeError::Transport(e.to_string()))?;
    let (mut sink, mut source) = stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                tracing::debug!("Websocket write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut liveness = HANDSHAKE_TIMEOUT;
    let result = loop {
        let message = match tokio::time::timeout(liveness, source.next()).await {
            Err(_) => {
                break Err(RealtimeError::Transport(
                    "server stopped sending pings".to_string(),
                ))
            }
            Ok(None) => break Ok(()),
            Ok(Some(Err(e))) => break Err(RealtimeError::Transport(e.to_string())),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match shared.handle_frame(&text, &out_tx) {
                Ok(FrameOutcome::Continue) => {}
                Ok(FrameOutcome::Opened(window)) => {
                    if let Some(window) = window {
                        liveness = window;
                    }
                }
                Ok(FrameOutcome::Connected) => {
                    backoff.reset();
                    tracing::info!("Websocket connected to {}", endpoint.origin);
                }
                Ok(FrameOutcome::Closed) => break Ok(()),
                Err(RealtimeError::Codec(reason)) => {
                    tracing::warn!("Ignoring malformed realtime frame: {}", reason)
                }
                Err(e) => break Err(e),
            },
            Message::Close(_) => break Ok(()),
            _ => {}
        }
    };

    writer.abort();
    result
}
