//! Shared, multiplexed streaming connection.
//!
//! A [`ConnectionManager`] owns one WebSocket, driven by a background actor task. Any number
//! of [`SubscriptionHandle`]s share it; per-key reference counting decides when subscribe and
//! unsubscribe frames are written. The actor authenticates on every (re)connect, answers
//! keep-alives, reconnects with capped exponential backoff after unclean closes and turns
//! quote updates into synthetic ticks for keys that never receive genuine trades.

use self::{
    backoff::{Backoff, ReconnectPolicy},
    state::{ConnectionEvent, ConnectionState},
    subscription::{KeyChange, SubscriptionId, SubscriptionTable},
};
use crate::{
    error::DataError,
    protocol::{ClientMessage, QuoteData, ServerMessage},
    streams::timeout::{DEFAULT_READ_TIMEOUT, TimeoutStream},
    types::{SubscriptionMode, SymbolKey, Tick, infer_side},
};
use chrono::Utc;
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use smol_str::SmolStr;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Exponential reconnect delays.
pub mod backoff;

/// [`ConnectionState`] machine.
pub mod state;

/// Reference-counted subscription bookkeeping.
pub mod subscription;

pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(250);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type Callback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Url,
    pub api_key: String,
    pub reconnect: ReconnectPolicy,
    /// Delay between unsubscribing and closing the socket on a graceful close
    pub close_grace: Duration,
    /// Silence after which the socket is considered dead
    pub read_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(url: Url, api_key: impl Into<String>) -> Self {
        Self {
            url,
            api_key: api_key.into(),
            reconnect: ReconnectPolicy::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Parse `url` and build a configuration with default timings.
    pub fn parse(url: &str, api_key: impl Into<String>) -> Result<Self, DataError> {
        let url = Url::parse(url).map_err(|_| DataError::Config {
            key: "ORDERFLOW_WS_URL",
            value: url.to_string(),
        })?;
        Ok(Self::new(url, api_key))
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_reconnect_base(mut self, base: Duration) -> Self {
        self.reconnect.base = base;
        self
    }

    pub fn with_reconnect_cap(mut self, cap: Duration) -> Self {
        self.reconnect.cap = cap;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Event delivered to subscription callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick {
        key: SymbolKey,
        tick: Tick,
        /// Inferred from a quote update rather than reported as a trade
        synthetic: bool,
    },
    ServerError {
        message: String,
    },
    /// Reconnection gave up; nothing more arrives until [`ConnectionManager::restart`]
    ReconnectExhausted {
        attempts: u32,
    },
}

enum Command {
    Subscribe {
        id: SubscriptionId,
        keys: Vec<SymbolKey>,
        mode: SubscriptionMode,
        callback: Callback,
    },
    Close {
        id: SubscriptionId,
        graceful: bool,
        done: Option<oneshot::Sender<()>>,
    },
    Restart,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to the connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Subscribe { id, keys, mode, .. } => f
                .debug_struct("Subscribe")
                .field("id", id)
                .field("keys", keys)
                .field("mode", mode)
                .finish(),
            Command::Close { id, graceful, .. } => f
                .debug_struct("Close")
                .field("id", id)
                .field("graceful", graceful)
                .finish(),
            Command::Restart => write!(f, "Restart"),
            Command::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

impl ConnectionManager {
    /// Spawn the connection actor on the current tokio runtime.
    ///
    /// The socket is opened lazily, on the first subscription.
    pub fn new(config: ConnectionConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = Actor {
            backoff: config.reconnect.backoff(),
            config,
            commands: command_rx,
            state_tx,
            table: SubscriptionTable::default(),
            subscribers: FnvHashMap::default(),
            quotes: FnvHashMap::default(),
            exhausted: false,
            grace_deadline: None,
            grace_waiters: Vec::new(),
            shutdown_waiter: None,
        };
        tokio::spawn(actor.run());

        Self {
            command_tx,
            state_rx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe `on_message` to events for `instruments` at `mode`.
    pub fn subscribe<F>(
        &self,
        instruments: impl IntoIterator<Item = SymbolKey>,
        mode: SubscriptionMode,
        on_message: F,
    ) -> Result<SubscriptionHandle, DataError>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut keys = instruments.into_iter().collect::<Vec<_>>();
        keys.sort();
        keys.dedup();

        self.command_tx
            .send(Command::Subscribe {
                id,
                keys: keys.clone(),
                mode,
                callback: Arc::new(on_message),
            })
            .map_err(|_| DataError::ManagerStopped)?;

        Ok(SubscriptionHandle {
            id,
            keys,
            command_tx: self.command_tx.clone(),
            state_rx: self.state_rx.clone(),
            closed: false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Re-enable reconnection after [`StreamEvent::ReconnectExhausted`].
    pub fn restart(&self) -> Result<(), DataError> {
        self.command_tx
            .send(Command::Restart)
            .map_err(|_| DataError::ManagerStopped)
    }

    /// Unsubscribe everything, close the socket and stop the actor.
    pub async fn shutdown(&self) -> Result<(), DataError> {
        let (done, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Shutdown { done })
            .map_err(|_| DataError::ManagerStopped)?;
        rx.await.map_err(|_| DataError::ManagerStopped)
    }
}

/// One subscription on the shared connection.
///
/// Dropping the handle closes the subscription gracefully without waiting.
#[derive(Debug)]
#[must_use = "dropping the handle closes the subscription"]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    keys: Vec<SymbolKey>,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    closed: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn keys(&self) -> &[SymbolKey] {
        &self.keys
    }

    pub fn ready_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Unsubscribe, wait out the grace period and close the socket if nothing else holds it.
    pub async fn close(mut self) -> Result<(), DataError> {
        self.closed = true;
        let (done, rx) = oneshot::channel();
        self.command_tx
            .send(Command::Close {
                id: self.id,
                graceful: true,
                done: Some(done),
            })
            .map_err(|_| DataError::ManagerStopped)?;
        rx.await.map_err(|_| DataError::ManagerStopped)
    }

    /// Drop the subscription immediately, without unsubscribing. Never blocks.
    pub fn force_close(mut self) {
        self.closed = true;
        let _ = self.command_tx.send(Command::Close {
            id: self.id,
            graceful: false,
            done: None,
        });
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.command_tx.send(Command::Close {
                id: self.id,
                graceful: true,
                done: None,
            });
        }
    }
}

struct Subscriber {
    keys: Vec<SymbolKey>,
    callback: Callback,
}

#[derive(Debug, Default)]
struct QuoteState {
    genuine_ticks: bool,
    last_ltp: Option<f64>,
}

enum Flow {
    Continue,
    Shutdown,
}

enum SessionEnd {
    /// No subscriptions left, socket closed on purpose
    Idle,
    Shutdown,
    /// Closed by the server, by a transport failure or by a rejected handshake
    Dropped(DataError),
}

struct Actor {
    config: ConnectionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    table: SubscriptionTable,
    subscribers: FnvHashMap<SubscriptionId, Subscriber>,
    quotes: FnvHashMap<SymbolKey, QuoteState>,
    backoff: Backoff,
    exhausted: bool,
    grace_deadline: Option<Instant>,
    grace_waiters: Vec<oneshot::Sender<()>>,
    shutdown_waiter: Option<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(mut self) {
        info!(url = %self.config.url, "connection manager started");

        loop {
            if self.table.is_empty() && !self.exhausted {
                // The next subscription after idling starts with the full attempt budget
                self.backoff.reset();
            }
            if self.table.is_empty() || self.exhausted {
                let Some(command) = self.commands.recv().await else {
                    break;
                };
                match self.handle_offline(command) {
                    Flow::Continue => continue,
                    Flow::Shutdown => break,
                }
            }

            match self.session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Idle => {
                    info!("no subscriptions remain, connection closed");
                }
                SessionEnd::Dropped(error) => match self.backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            %error,
                            attempt = self.backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "connection lost, reconnecting after backoff"
                        );
                        if let Flow::Shutdown = self.wait_backoff(delay).await {
                            break;
                        }
                    }
                    None => {
                        let attempts = self.backoff.attempts();
                        error!(%error, attempts, "reconnect attempts exhausted, restart required");
                        self.exhausted = true;
                        self.broadcast(&StreamEvent::ReconnectExhausted { attempts });
                    }
                },
            }
        }

        self.release_grace_waiters();
        self.commands.close();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("connection manager stopped");
        if let Some(done) = self.shutdown_waiter.take() {
            let _ = done.send(());
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.state();
        match current.transition(event) {
            Ok(next) => {
                debug!(from = %current, to = %next, %event, "connection state changed");
                self.state_tx.send_replace(next);
            }
            Err(error) => warn!(%error, "connection event ignored"),
        }
    }

    /// Handle a command while no socket is open.
    fn handle_offline(&mut self, command: Command) -> Flow {
        match command {
            Command::Subscribe {
                id,
                keys,
                mode,
                callback,
            } => {
                self.register(id, keys, mode, callback);
            }
            Command::Close { id, done, .. } => {
                self.unregister(id);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::Restart => {
                if self.exhausted {
                    info!("connection manager restarted");
                }
                self.exhausted = false;
                self.backoff.reset();
            }
            Command::Shutdown { done } => {
                self.shutdown_waiter = Some(done);
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    fn register(
        &mut self,
        id: SubscriptionId,
        keys: Vec<SymbolKey>,
        mode: SubscriptionMode,
        callback: Callback,
    ) -> Vec<(SymbolKey, SubscriptionMode)> {
        let changes = keys
            .iter()
            .filter_map(|key| match self.table.acquire(id, key, mode) {
                KeyChange::Subscribe(mode) => Some((key.clone(), mode)),
                _ => None,
            })
            .collect();

        debug!(%id, keys = keys.len(), %mode, "subscription registered");
        self.subscribers.insert(id, Subscriber { keys, callback });
        changes
    }

    /// Remove a subscriber, returning the keys nobody holds any more.
    fn unregister(&mut self, id: SubscriptionId) -> Vec<SymbolKey> {
        let Some(subscriber) = self.subscribers.remove(&id) else {
            return Vec::new();
        };

        let released = subscriber
            .keys
            .into_iter()
            .filter(|key| self.table.release(id, key) == KeyChange::Unsubscribe)
            .collect::<Vec<_>>();

        for key in &released {
            self.quotes.remove(key);
        }
        debug!(%id, released = released.len(), "subscription removed");
        released
    }

    async fn wait_backoff(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Flow::Shutdown;
                    };
                    if let Flow::Shutdown = self.handle_offline(command) {
                        return Flow::Shutdown;
                    }
                    if self.table.is_empty() {
                        return Flow::Continue;
                    }
                }
            }
        }
    }

    async fn session(&mut self) -> SessionEnd {
        self.transition(ConnectionEvent::Connect);
        info!(url = %self.config.url, "connecting");

        let connect = tokio::time::timeout(
            self.config.read_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await;

        let socket = match connect {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(error)) => {
                self.transition(ConnectionEvent::SocketClosed);
                return SessionEnd::Dropped(DataError::from(error));
            }
            Err(_) => {
                self.transition(ConnectionEvent::SocketClosed);
                return SessionEnd::Dropped(DataError::Socket(format!(
                    "connect timeout after {} seconds",
                    self.config.read_timeout.as_secs()
                )));
            }
        };

        self.transition(ConnectionEvent::SocketOpened);
        let (mut write, read) = socket.split();
        let mut read = TimeoutStream::new(read, self.config.read_timeout);

        if let Err(error) = send(&mut write, &ClientMessage::authenticate(&self.config.api_key)).await {
            self.transition(ConnectionEvent::SocketClosed);
            return SessionEnd::Dropped(error);
        }

        let end = loop {
            tokio::select! {
                message = read.next() => match message {
                    None => break SessionEnd::Dropped(DataError::Socket("ConnectionClosed: stream ended".to_string())),
                    Some(Err(error)) => break SessionEnd::Dropped(error),
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Dropped(DataError::Socket(format!("ConnectionClosed by server: {frame:?}")));
                    }
                    Some(Ok(message)) => {
                        if let Err(error) = self.handle_message(message, &mut write).await {
                            if error.is_terminal() {
                                break SessionEnd::Dropped(error);
                            }
                            warn!(%error, "server message dropped");
                        }
                    }
                },
                command = self.commands.recv() => {
                    let flow = match command {
                        Some(command) => self.handle_online(command, &mut write).await,
                        None => Ok(Flow::Shutdown),
                    };
                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Shutdown) => {
                            self.unsubscribe_all(&mut write).await;
                            self.close_socket(&mut write).await;
                            break SessionEnd::Shutdown;
                        }
                        Err(error) if error.is_terminal() => break SessionEnd::Dropped(error),
                        Err(error) => warn!(%error, "failed to write frame"),
                    }
                    if self.table.is_empty() && self.grace_deadline.is_none() {
                        self.close_socket(&mut write).await;
                        break SessionEnd::Idle;
                    }
                },
                _ = tokio::time::sleep_until(self.grace_deadline.unwrap_or_else(Instant::now)), if self.grace_deadline.is_some() => {
                    self.grace_deadline = None;
                    if self.table.is_empty() {
                        self.close_socket(&mut write).await;
                        break SessionEnd::Idle;
                    }
                    self.release_grace_waiters();
                }
            }
        };

        if matches!(end, SessionEnd::Dropped(_)) && self.state() != ConnectionState::Disconnected {
            self.transition(ConnectionEvent::SocketClosed);
        }
        self.release_grace_waiters();
        end
    }

    async fn handle_online(&mut self, command: Command, write: &mut WsSink) -> Result<Flow, DataError> {
        match command {
            Command::Subscribe {
                id,
                keys,
                mode,
                callback,
            } => {
                let changes = self.register(id, keys, mode, callback);
                if self.state().can_subscribe() {
                    for (key, mode) in changes {
                        send(write, &ClientMessage::subscribe(&key, mode)).await?;
                        info!(%key, %mode, "subscribed");
                    }
                }
            }
            Command::Close { id, graceful, done } => {
                let released = self.unregister(id);

                if graceful {
                    if self.state().can_subscribe() {
                        for key in &released {
                            send(write, &ClientMessage::unsubscribe(key)).await?;
                            info!(%key, "unsubscribed");
                        }
                    }
                    self.grace_deadline = Some(Instant::now() + self.config.close_grace);
                    self.grace_waiters.extend(done);
                } else if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::Restart => {
                self.exhausted = false;
                self.backoff.reset();
            }
            Command::Shutdown { done } => {
                self.shutdown_waiter = Some(done);
                return Ok(Flow::Shutdown);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_message(&mut self, message: Message, write: &mut WsSink) -> Result<(), DataError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await?;
                return Ok(());
            }
            Message::Pong(_) | Message::Frame(_) => return Ok(()),
            Message::Binary(payload) => {
                debug!(bytes = payload.len(), "binary frame ignored");
                return Ok(());
            }
            Message::Close(_) => return Ok(()),
        };

        match ServerMessage::parse(&text)? {
            ServerMessage::Ping => {
                send(write, &ClientMessage::pong()).await?;
            }
            ServerMessage::Auth { status, message } => {
                if !ServerMessage::auth_accepted(&status) {
                    self.transition(ConnectionEvent::AuthRejected);
                    let reason = message
                        .or_else(|| status.map(|status| status.to_string()))
                        .unwrap_or_default();
                    return Err(DataError::AuthRejected(reason));
                }
                if self.state().can_subscribe() {
                    debug!("duplicate authentication acknowledgement ignored");
                    return Ok(());
                }

                self.transition(ConnectionEvent::AuthAccepted);
                self.backoff.reset();
                info!("authenticated");

                for (key, mode) in self.table.active() {
                    send(write, &ClientMessage::subscribe(&key, mode)).await?;
                    info!(%key, %mode, "subscribed");
                }
            }
            ServerMessage::Error { message, code } => {
                let message = match (message, code) {
                    (Some(message), _) => message,
                    (None, Some(code)) => format!("code {code}"),
                    (None, None) => "unspecified".to_string(),
                };
                warn!(%message, "server reported an error");
                self.broadcast(&StreamEvent::ServerError { message });
            }
            ServerMessage::TickData {
                symbol,
                exchange,
                tick,
            } => {
                let Some(key) = self.resolve_key(&symbol, exchange.as_ref()) else {
                    debug!(%symbol, "tick for unsubscribed symbol dropped");
                    return Ok(());
                };
                let tick = Tick::try_from(tick)?;
                self.quotes.entry(key.clone()).or_default().genuine_ticks = true;
                self.dispatch(&key, &StreamEvent::Tick {
                    key: key.clone(),
                    tick,
                    synthetic: false,
                });
            }
            ServerMessage::MarketData {
                symbol,
                exchange,
                data,
            } => {
                let Some(key) = self.resolve_key(&symbol, exchange.as_ref()) else {
                    debug!(%symbol, "quote for unsubscribed symbol dropped");
                    return Ok(());
                };
                if let Some(tick) = self.synthesise(&key, &data) {
                    self.dispatch(&key, &StreamEvent::Tick {
                        key: key.clone(),
                        tick,
                        synthetic: true,
                    });
                }
            }
        }

        Ok(())
    }

    /// Map a wire symbol (and optional exchange) onto a held key.
    fn resolve_key(&self, symbol: &SmolStr, exchange: Option<&SmolStr>) -> Option<SymbolKey> {
        match exchange {
            Some(exchange) => {
                let key = SymbolKey::new(symbol, exchange);
                (self.table.ref_count(&key) > 0).then_some(key)
            }
            None => {
                let symbol = symbol.trim().to_uppercase();
                self.table
                    .active()
                    .into_iter()
                    .map(|(key, _)| key)
                    .find(|key| key.symbol == symbol)
            }
        }
    }

    /// Infer a tick from a quote, for keys that have never received a genuine tick.
    fn synthesise(&mut self, key: &SymbolKey, data: &QuoteData) -> Option<Tick> {
        let quote = self.quotes.entry(key.clone()).or_default();
        let previous_ltp = quote.last_ltp.replace(data.ltp);
        if quote.genuine_ticks {
            return None;
        }

        let volume = data.ltq.filter(|ltq| ltq.is_finite() && *ltq > 0.0)?;
        let side = infer_side(data.ltp, data.bid, data.ask, previous_ltp);
        let time = data
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        match Tick::with_quote(time, data.ltp, volume, side, data.bid, data.ask) {
            Ok(tick) => Some(tick),
            Err(error) => {
                debug!(%key, %error, "quote discarded");
                None
            }
        }
    }

    fn dispatch(&self, key: &SymbolKey, event: &StreamEvent) {
        for (id, subscriber) in &self.subscribers {
            if subscriber.keys.contains(key) {
                invoke(*id, &subscriber.callback, event);
            }
        }
    }

    fn broadcast(&self, event: &StreamEvent) {
        for (id, subscriber) in &self.subscribers {
            invoke(*id, &subscriber.callback, event);
        }
    }

    async fn unsubscribe_all(&mut self, write: &mut WsSink) {
        if !self.state().can_subscribe() {
            return;
        }
        for (key, _) in self.table.active() {
            if let Err(error) = send(write, &ClientMessage::unsubscribe(&key)).await {
                debug!(%key, %error, "unsubscribe not sent");
                return;
            }
        }
        tokio::time::sleep(self.config.close_grace).await;
    }

    async fn close_socket(&mut self, write: &mut WsSink) {
        self.transition(ConnectionEvent::CloseRequested);
        if let Err(error) = write.send(Message::Close(None)).await {
            debug!(%error, "close frame not sent");
        }
        let _ = write.close().await;
        self.transition(ConnectionEvent::SocketClosed);
    }

    fn release_grace_waiters(&mut self) {
        for done in self.grace_waiters.drain(..) {
            let _ = done.send(());
        }
    }
}

async fn send(write: &mut WsSink, message: &ClientMessage) -> Result<(), DataError> {
    let text = message.to_json()?;
    write.send(Message::text(text)).await?;
    Ok(())
}

fn invoke(id: SubscriptionId, callback: &Callback, event: &StreamEvent) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!(%id, "subscription callback panicked, continuing with remaining subscribers");
    }
}
