use crate::config::HubConfig;
use crate::error::HubError;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives what the connection loop reads. Called from the loop's task, so
/// implementations must not block and must not panic on bad input.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, payload: &str);
    fn on_connection_change(&self, connected: bool, error: Option<&str>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    Connected,
    Failed,
    StopRequested,
    Closed,
}

impl ConnectionState {
    /// The transition table. `None` means the event is not valid in this state.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;
        match (self, event) {
            (S::Disconnected, E::Start) => Some(S::Connecting),
            (S::Connecting, E::Connected) => Some(S::Connected),
            (S::Connecting, E::Failed) | (S::Connected, E::Failed) => Some(S::Connecting),
            (S::Connecting, E::StopRequested) | (S::Connected, E::StopRequested) => {
                Some(S::Closing)
            }
            (S::Closing, E::Closed) => Some(S::Disconnected),
            (S::Disconnected, E::StopRequested) => Some(S::Disconnected),
            _ => None,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Lock-free holder of the current state so readers never wait on the loop.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let current = self.get();
        match current.on(event) {
            Some(next) => {
                self.0.store(next as u8, Ordering::Release);
                debug!(from = ?current, ?event, to = ?next, "connection state transition");
                next
            }
            None => {
                warn!(state = ?current, ?event, "ignoring invalid connection state transition");
                current
            }
        }
    }

    fn force(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, Error)]
enum TransportError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("stream error: {0}")]
    Stream(#[source] tungstenite::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone)]
struct Settings {
    url: String,
    connect_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
    shutdown_timeout: Duration,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    handler: Arc<dyn FrameHandler>,
}

/// Owns the WebSocket session to the gateway and keeps it alive.
pub struct TransportConnector {
    settings: Settings,
    state: Arc<StateCell>,
    worker: Mutex<Option<Worker>>,
}

impl TransportConnector {
    /// Fails only for an address that can never be connected to.
    pub fn new(config: &HubConfig) -> Result<Self, HubError> {
        config.validate()?;
        Ok(Self {
            settings: Settings {
                url: config.url(),
                connect_timeout: config.connect_timeout,
                initial_backoff: config.initial_backoff,
                max_backoff: config.max_backoff,
                heartbeat_interval: config.heartbeat_interval,
                idle_timeout: config.idle_timeout,
                shutdown_timeout: config.shutdown_timeout,
            },
            state: Arc::new(StateCell::new()),
            worker: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.settings.url
    }

    /// Spawns the connection loop. Returns false if one is already running.
    pub fn start(&self, handler: Arc<dyn FrameHandler>) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!(url = %self.settings.url, "transport already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.settings.clone(),
            self.state.clone(),
            handler.clone(),
            cancel.clone(),
        ));
        *worker = Some(Worker {
            cancel,
            handle,
            handler,
        });
        true
    }

    /// Cancels the loop and waits, at most `shutdown_timeout`, for it to release the
    /// socket. Calling it when stopped does nothing.
    pub async fn stop(&self) {
        let Some(Worker {
            cancel,
            mut handle,
            handler,
        }) = self.worker.lock().take()
        else {
            self.state.apply(ConnectionEvent::StopRequested);
            return;
        };

        cancel.cancel();
        match timeout(self.settings.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "transport task ended abnormally"),
            Err(_) => {
                warn!(
                    timeout = ?self.settings.shutdown_timeout,
                    "transport did not stop in time; aborting"
                );
                handle.abort();
                // The loop never got to report its own shutdown
                handler.on_connection_change(false, None);
            }
        }
        self.state.force(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }
}

impl Drop for TransportConnector {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
        }
    }
}

async fn run(
    settings: Settings,
    state: Arc<StateCell>,
    handler: Arc<dyn FrameHandler>,
    cancel: CancellationToken,
) {
    state.apply(ConnectionEvent::Start);
    let mut backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);

    loop {
        info!(url = %settings.url, "connecting to PVS");
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(settings.connect_timeout, connect_async(settings.url.as_str())) => result,
        };

        let failure = match connected {
            Ok(Ok((ws, _response))) => {
                state.apply(ConnectionEvent::Connected);
                handler.on_connection_change(true, None);
                backoff.reset();
                info!(url = %settings.url, "connected to PVS");

                match receive(ws, &settings, handler.as_ref(), &cancel).await {
                    Ok(()) => break,
                    Err(e) => e,
                }
            }
            Ok(Err(e)) => TransportError::Connect(e),
            Err(_) => TransportError::ConnectTimeout(settings.connect_timeout),
        };

        state.apply(ConnectionEvent::Failed);
        let message = failure.to_string();
        handler.on_connection_change(false, Some(&message));

        let delay = backoff.next_delay();
        warn!(error = %message, retry_in = ?delay, "PVS connection lost");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    state.apply(ConnectionEvent::StopRequested);
    handler.on_connection_change(false, None);
    state.apply(ConnectionEvent::Closed);
    info!(url = %settings.url, "transport stopped");
}

/// Reads frames until cancelled (`Ok`) or until the connection fails (`Err`).
async fn receive(
    mut ws: WsStream,
    settings: &Settings,
    handler: &dyn FrameHandler,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = sleep(settings.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let grace = settings.shutdown_timeout / 2;
                match timeout(grace, ws.close(None)).await {
                    Ok(Ok(())) => debug!("websocket closed"),
                    Ok(Err(e)) => debug!(error = %e, "websocket close failed"),
                    Err(_) => debug!("websocket close handshake timed out"),
                }
                return Ok(());
            }
            _ = &mut idle => return Err(TransportError::IdleTimeout(settings.idle_timeout)),
            _ = heartbeat.tick() => {
                ws.send(Message::Ping(Vec::new()))
                    .await
                    .map_err(TransportError::Stream)?;
            }
            frame = ws.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(TransportError::Stream(e)),
                    None => return Err(TransportError::Closed),
                };
                idle.as_mut().reset(Instant::now() + settings.idle_timeout);

                match message {
                    Message::Text(text) => handler.on_frame(&text),
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => handler.on_frame(text),
                        Err(_) => debug!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                    },
                    Message::Close(reason) => {
                        debug!(?reason, "PVS sent close frame");
                        return Err(TransportError::Closed);
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        frames: Mutex<Vec<String>>,
        changes: Mutex<Vec<(bool, Option<String>)>>,
    }

    impl FrameHandler for RecordingHandler {
        fn on_frame(&self, payload: &str) {
            self.frames.lock().push(payload.to_string());
        }

        fn on_connection_change(&self, connected: bool, error: Option<&str>) {
            self.changes.lock().push((connected, error.map(str::to_string)));
        }
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn config(port: u16) -> HubConfig {
        HubConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
            ..HubConfig::default()
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionEvent as E;
        use ConnectionState as S;

        assert_eq!(S::Disconnected.on(E::Start), Some(S::Connecting));
        assert_eq!(S::Connecting.on(E::Connected), Some(S::Connected));
        assert_eq!(S::Connecting.on(E::Failed), Some(S::Connecting));
        assert_eq!(S::Connected.on(E::Failed), Some(S::Connecting));
        assert_eq!(S::Connecting.on(E::StopRequested), Some(S::Closing));
        assert_eq!(S::Connected.on(E::StopRequested), Some(S::Closing));
        assert_eq!(S::Closing.on(E::Closed), Some(S::Disconnected));
        assert_eq!(S::Disconnected.on(E::StopRequested), Some(S::Disconnected));

        assert_eq!(S::Disconnected.on(E::Connected), None);
        assert_eq!(S::Connected.on(E::Start), None);
        assert_eq!(S::Closing.on(E::Start), None);
        assert_eq!(S::Closing.on(E::Connected), None);
        assert_eq!(S::Connected.on(E::Closed), None);
    }

    #[test]
    fn test_state_cell_round_trip() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert_eq!(cell.apply(ConnectionEvent::Connected), ConnectionState::Disconnected);
        assert_eq!(cell.apply(ConnectionEvent::Start), ConnectionState::Connecting);
        assert_eq!(cell.apply(ConnectionEvent::Connected), ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }

    #[test]
    fn test_backoff_is_capped_exponential() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_address_is_fatal() {
        let result = TransportConnector::new(&HubConfig {
            host: "not a host".to_string(),
            ..HubConfig::default()
        });
        assert!(matches!(result, Err(HubError::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff() {
        let connector = TransportConnector::new(&config(closed_port())).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        assert!(connector.start(handler.clone()));

        // Wait for the refused connect to put the loop into its 10 s backoff
        for _ in 0..50 {
            if !handler.changes.lock().is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(connector.state(), ConnectionState::Connecting);
        assert!(!connector.is_connected());
        {
            let changes = handler.changes.lock();
            assert!(!changes.is_empty());
            assert!(!changes[0].0);
            assert!(changes[0].1.is_some());
        }

        let started = std::time::Instant::now();
        connector.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert!(handler.frames.lock().is_empty());
    }

    /// Records like `RecordingHandler` but blocks its thread on every frame.
    #[derive(Default)]
    struct StallingHandler {
        stalled: std::sync::atomic::AtomicBool,
        changes: Mutex<Vec<(bool, Option<String>)>>,
    }

    impl FrameHandler for StallingHandler {
        fn on_frame(&self, _payload: &str) {
            self.stalled.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_secs(1));
        }

        fn on_connection_change(&self, connected: bool, error: Option<&str>) {
            self.changes.lock().push((connected, error.map(str::to_string)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_past_deadline_reports_disconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("{\"pv_p\": 1.0}".to_string())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = TransportConnector::new(&HubConfig {
            shutdown_timeout: Duration::from_millis(200),
            ..config(port)
        })
        .unwrap();
        let handler = Arc::new(StallingHandler::default());
        assert!(connector.start(handler.clone()));
        for _ in 0..100 {
            if handler.stalled.load(Ordering::SeqCst) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(handler.stalled.load(Ordering::SeqCst));

        let started = std::time::Instant::now();
        connector.stop().await;
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        let changes = handler.changes.lock();
        assert_eq!(changes.first(), Some(&(true, None)));
        assert_eq!(changes.last(), Some(&(false, None)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let connector = TransportConnector::new(&config(closed_port())).unwrap();
        connector.stop().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);

        let handler = Arc::new(RecordingHandler::default());
        assert!(connector.start(handler.clone()));
        assert!(!connector.start(handler.clone()));
        connector.stop().await;
        connector.stop().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);

        // Can be started again after a stop
        assert!(connector.start(handler));
        connector.stop().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }
}
