//! Connection manager: one task owning the session lifecycle.
//!
//! The manager holds the only mutable connection state. It connects,
//! probes liveness, schedules reconnects with exponential backoff, and
//! publishes status snapshots over a watch channel. Consumers reach the
//! live session through a shared slot that is emptied the moment a
//! session is condemned, so nothing ever talks through a dead socket.
//!
//! Because a retired session's event receiver is dropped with it, late
//! failure signals from the old wire cannot double-schedule reconnects:
//! one drop, one retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pairing::{PairingClient, ServerCredentials};
use crate::session;
use crate::session::{SessionError, SessionEvent, SessionHandle, TeamMessage};
use crate::types::{ServerInfo, StatusSnapshot};

/// Timing knobs for the connection lifecycle. Defaults are production
/// values; tests shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Ceiling on one connect attempt.
    pub connect_timeout: Duration,
    /// Cadence of liveness probes while connected.
    pub probe_interval: Duration,
    /// Ceiling on one liveness probe.
    pub probe_timeout: Duration,
    /// Longest tolerated gap without a probe response before the
    /// connection is treated as dead.
    pub stale_after: Duration,
    /// First reconnect delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_cap: Duration,
    /// Consecutive failed reconnects tolerated before parking.
    pub max_attempts: u32,
    /// Ceiling on the one-time server info fetch.
    pub info_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(15),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            max_attempts: 10,
            info_timeout: Duration::from_secs(10),
        }
    }
}

/// Reconnect delay for the given attempt number: `base * 2^attempt`,
/// capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    (base * factor).min(cap)
}

/// Produces a fresh session per connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        creds: &ServerCredentials,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), SessionError>;
}

/// Production connector: the WebSocket wire in `session`.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        creds: &ServerCredentials,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), SessionError> {
        session::connect(creds).await
    }
}

enum ManagerCommand {
    Start,
    Shutdown,
    AuthFailure,
}

/// Cheap-to-clone view of the manager: status, live session slot,
/// control commands.
#[derive(Clone)]
pub struct ManagerHandle {
    status_rx: watch::Receiver<StatusSnapshot>,
    slot: Arc<RwLock<Option<SessionHandle>>>,
    ctrl_tx: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    /// Current status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status_rx.borrow().clone()
    }

    /// Watch channel receiving every status transition.
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    /// Handle to the live session, if one is up right now.
    pub fn session(&self) -> Option<SessionHandle> {
        self.slot.read().clone()
    }

    /// Begin connecting (or retry immediately when parked). A no-op
    /// while already connected.
    pub async fn start(&self) {
        let _ = self.ctrl_tx.send(ManagerCommand::Start).await;
    }

    /// Disconnect and stop the manager task.
    pub async fn shutdown(&self) {
        let _ = self.ctrl_tx.send(ManagerCommand::Shutdown).await;
    }

    /// Report that a request outside the manager's own probes came back
    /// with an invalid-session error, so a credential refresh is due.
    pub fn note_invalid_session(&self) {
        let _ = self.ctrl_tx.try_send(ManagerCommand::AuthFailure);
    }
}

/// Spawn the manager task. It stays idle until `start()`.
///
/// Inbound team-chat messages are forwarded through `chat_tx`.
pub fn spawn(
    connector: Arc<dyn Connector>,
    pairing: Arc<dyn PairingClient>,
    config: ManagerConfig,
    chat_tx: mpsc::UnboundedSender<TeamMessage>,
) -> ManagerHandle {
    let (ctrl_tx, ctrl_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
    let slot: Arc<RwLock<Option<SessionHandle>>> = Arc::new(RwLock::new(None));

    let manager = Manager {
        connector,
        pairing,
        config,
        chat_tx,
        status_tx,
        slot: slot.clone(),
        state: LinkState::Idle,
        creds: None,
        attempt: 0,
        needs_refresh: false,
        last_connected: None,
        last_error: None,
        server_info: None,
    };
    tokio::spawn(manager.run(ctrl_rx));

    ManagerHandle {
        status_rx,
        slot,
        ctrl_tx,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Why the connected phase ended.
enum Phase {
    Dropped,
    Shutdown,
}

struct Manager {
    connector: Arc<dyn Connector>,
    pairing: Arc<dyn PairingClient>,
    config: ManagerConfig,
    chat_tx: mpsc::UnboundedSender<TeamMessage>,
    status_tx: watch::Sender<StatusSnapshot>,
    slot: Arc<RwLock<Option<SessionHandle>>>,
    state: LinkState,
    creds: Option<ServerCredentials>,
    attempt: u32,
    needs_refresh: bool,
    last_connected: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
    server_info: Option<ServerInfo>,
}

impl Manager {
    async fn run(mut self, mut ctrl_rx: mpsc::Receiver<ManagerCommand>) {
        // Idle until the first successful start.
        loop {
            match ctrl_rx.recv().await {
                Some(ManagerCommand::Start) => {
                    if self.load_credentials().await {
                        break;
                    }
                }
                Some(ManagerCommand::AuthFailure) => {}
                Some(ManagerCommand::Shutdown) | None => return,
            }
        }

        // One iteration per connect attempt.
        loop {
            let Some(creds) = self.creds.clone() else {
                warn!("no credentials loaded; manager stopping");
                return;
            };

            self.state = LinkState::Connecting;
            self.publish();
            info!(host = %creds.host, port = creds.port, "connecting to companion server");

            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(&creds),
            )
            .await;
            match attempt {
                Ok(Ok((handle, events))) => {
                    self.on_connected(&handle).await;
                    match self.connected_phase(handle, events, &mut ctrl_rx).await {
                        Phase::Dropped => {}
                        Phase::Shutdown => return,
                    }
                }
                Ok(Err(e)) => self.note_failure(format!("connect failed: {e}")),
                Err(_) => self.note_failure("connect attempt timed out".to_string()),
            }

            if self.attempt >= self.config.max_attempts {
                self.last_error = Some("reconnect attempts exhausted".to_string());
                self.publish();
                warn!(
                    attempts = self.attempt,
                    "reconnect attempts exhausted; waiting for an explicit start"
                );
                loop {
                    match ctrl_rx.recv().await {
                        Some(ManagerCommand::Start) => {
                            self.attempt = 0;
                            self.load_credentials().await;
                            break;
                        }
                        Some(ManagerCommand::AuthFailure) => self.needs_refresh = true,
                        Some(ManagerCommand::Shutdown) | None => return,
                    }
                }
                continue;
            }

            let delay = backoff_delay(
                self.attempt,
                self.config.backoff_base,
                self.config.backoff_cap,
            );
            self.attempt += 1;
            self.publish();
            info!(
                attempt = self.attempt,
                delay_secs = delay.as_secs_f64(),
                "scheduling reconnect"
            );

            let deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if self.needs_refresh {
                            self.try_refresh().await;
                        }
                        break;
                    }
                    cmd = ctrl_rx.recv() => match cmd {
                        Some(ManagerCommand::Start) => {
                            self.attempt = 0;
                            self.load_credentials().await;
                            break;
                        }
                        Some(ManagerCommand::AuthFailure) => self.needs_refresh = true,
                        Some(ManagerCommand::Shutdown) | None => return,
                    }
                }
            }
        }
    }

    /// Live phase: forward broadcasts, probe liveness, watch for death.
    async fn connected_phase(
        &mut self,
        handle: SessionHandle,
        mut events: mpsc::Receiver<SessionEvent>,
        ctrl_rx: &mut mpsc::Receiver<ManagerCommand>,
    ) -> Phase {
        let mut probe = tokio::time::interval_at(
            Instant::now() + self.config.probe_interval,
            self.config.probe_interval,
        );
        let mut last_ok = Instant::now();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Connected) => {}
                    Some(SessionEvent::MarkersChanged) => {}
                    Some(SessionEvent::TeamMessage(msg)) => {
                        let _ = self.chat_tx.send(msg);
                    }
                    Some(SessionEvent::Error(e)) => {
                        self.drop_session(&handle, format!("session error: {e}")).await;
                        return Phase::Dropped;
                    }
                    Some(SessionEvent::Disconnected) | None => {
                        self.drop_session(&handle, "connection lost").await;
                        return Phase::Dropped;
                    }
                },
                _ = probe.tick() => {
                    match handle.check_subscription(self.config.probe_timeout).await {
                        // Any response at all proves the link is alive.
                        Ok(_) | Err(SessionError::Server(_)) => {
                            last_ok = Instant::now();
                        }
                        Err(SessionError::InvalidSession) => {
                            self.needs_refresh = true;
                            self.drop_session(&handle, "server rejected the session").await;
                            return Phase::Dropped;
                        }
                        Err(e) => {
                            debug!(error = %e, "liveness probe got no response");
                        }
                    }
                    if last_ok.elapsed() > self.config.stale_after {
                        self.drop_session(&handle, "liveness probes stale").await;
                        return Phase::Dropped;
                    }
                },
                cmd = ctrl_rx.recv() => match cmd {
                    Some(ManagerCommand::Start) => {
                        debug!("start requested while connected; ignoring");
                    }
                    Some(ManagerCommand::AuthFailure) => {
                        self.needs_refresh = true;
                        self.drop_session(&handle, "server rejected the session").await;
                        return Phase::Dropped;
                    }
                    Some(ManagerCommand::Shutdown) | None => {
                        handle.disconnect().await;
                        *self.slot.write() = None;
                        self.state = LinkState::Idle;
                        self.publish();
                        info!("manager shut down");
                        return Phase::Shutdown;
                    }
                }
            }
        }
    }

    async fn on_connected(&mut self, handle: &SessionHandle) {
        self.attempt = 0;
        self.needs_refresh = false;
        self.state = LinkState::Connected;
        self.last_connected = Some(Utc::now());
        self.last_error = None;
        *self.slot.write() = Some(handle.clone());
        self.publish();
        info!("connected to companion server");

        match handle.get_info(self.config.info_timeout).await {
            Ok(response) => {
                let raw = response.get("info").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<ServerInfo>(raw) {
                    Ok(server_info) => {
                        info!(
                            server = %server_info.name,
                            map_size = server_info.map_size,
                            players = server_info.players,
                            max_players = server_info.max_players,
                            "server info",
                        );
                        self.server_info = Some(server_info);
                        self.publish();
                    }
                    Err(e) => warn!(error = %e, "malformed server info response"),
                }
            }
            Err(SessionError::InvalidSession) => {
                warn!("server info fetch rejected the session");
                self.needs_refresh = true;
            }
            Err(e) => warn!(error = %e, "failed to fetch server info"),
        }
    }

    async fn drop_session(&mut self, handle: &SessionHandle, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "dropping session");
        handle.disconnect().await;
        *self.slot.write() = None;
        self.state = LinkState::Disconnected;
        self.last_error = Some(reason);
        self.publish();
    }

    fn note_failure(&mut self, reason: String) {
        warn!(%reason, "connect attempt failed");
        self.state = LinkState::Disconnected;
        self.last_error = Some(reason);
        self.publish();
    }

    /// Load credentials from the pairing source. Publishes the error and
    /// returns false when nothing is paired.
    async fn load_credentials(&mut self) -> bool {
        match self.pairing.load().await {
            Ok(Some(creds)) => {
                self.creds = Some(creds);
                true
            }
            Ok(None) => {
                warn!("no server paired; staying idle");
                self.last_error = Some("no server paired".to_string());
                self.publish();
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to load credentials");
                self.last_error = Some(format!("failed to load credentials: {e}"));
                self.publish();
                false
            }
        }
    }

    /// One credential-refresh attempt. Failure is logged and the old
    /// credentials stay in use; the flag is cleared either way so a
    /// broken sidecar cannot stall the reconnect loop.
    async fn try_refresh(&mut self) {
        self.needs_refresh = false;
        let Some(current) = self.creds.clone() else {
            return;
        };
        info!("attempting credential refresh before reconnect");
        match self.pairing.refresh(&current).await {
            Ok(fresh) => {
                info!("credential refresh succeeded");
                self.creds = Some(fresh);
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed; keeping current credentials");
            }
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(StatusSnapshot {
            connected: self.state == LinkState::Connected,
            connecting: self.state == LinkState::Connecting,
            last_connected: self.last_connected,
            last_error: self.last_error.clone(),
            reconnect_attempt: self.attempt,
            server_info: self.server_info.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WireCommand;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── backoff ────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        let delays: Vec<u64> = (0..5)
            .map(|n| backoff_delay(n, base, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80]);
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(6, base, cap).as_secs(), 300);
        assert_eq!(backoff_delay(10, base, cap).as_secs(), 300);
        assert_eq!(backoff_delay(u32::MAX, base, cap).as_secs(), 300);
    }

    // ── fakes ──────────────────────────────────────────────────────

    #[derive(Clone, Copy, PartialEq)]
    enum Script {
        Refuse,
        Accept,
        AcceptButInvalid,
        /// Accept, then never answer liveness probes.
        AcceptButMute,
        /// Never resolve the connect call at all.
        Hang,
    }

    struct FakeConnector {
        script: Mutex<VecDeque<Script>>,
        connects: AtomicUsize,
        tokens: Mutex<Vec<i64>>,
        event_taps: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    }

    impl FakeConnector {
        fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                connects: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
                event_taps: Mutex::new(Vec::new()),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// Event sender feeding the nth session's receiver.
        fn events(&self, n: usize) -> mpsc::Sender<SessionEvent> {
            self.event_taps.lock()[n].clone()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            creds: &ServerCredentials,
        ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), SessionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().push(creds.player_token);
            let script = self
                .script
                .lock()
                .pop_front()
                .unwrap_or(Script::Accept);
            if script == Script::Refuse {
                return Err(SessionError::Connect("refused".to_string()));
            }
            if script == Script::Hang {
                std::future::pending::<()>().await;
            }

            let (handle, mut cmd_rx) = session::in_memory(16);
            let (event_tx, event_rx) = mpsc::channel(16);
            self.event_taps.lock().push(event_tx);
            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    match cmd {
                        WireCommand::Call { body, reply } => {
                            let probe = body.get("checkSubscription").is_some();
                            if probe && script == Script::AcceptButInvalid {
                                let _ = reply.send(Err(SessionError::InvalidSession));
                            } else if probe && script == Script::AcceptButMute {
                                // Dropping the reply fails the probe without
                                // a response, as a dead link would.
                                drop(reply);
                            } else {
                                let _ = reply.send(Ok(json!({})));
                            }
                        }
                        WireCommand::Disconnect => break,
                    }
                }
            });
            Ok((handle, event_rx))
        }
    }

    struct FakePairing {
        creds: Mutex<Option<ServerCredentials>>,
        refreshes: AtomicUsize,
        refreshed_token: i64,
    }

    impl FakePairing {
        fn paired(token: i64) -> Arc<Self> {
            Arc::new(Self {
                creds: Mutex::new(Some(ServerCredentials {
                    host: "203.0.113.9".to_string(),
                    port: 28082,
                    player_id: 76561198000000001,
                    player_token: token,
                })),
                refreshes: AtomicUsize::new(0),
                refreshed_token: token + 1000,
            })
        }

        fn unpaired() -> Arc<Self> {
            Arc::new(Self {
                creds: Mutex::new(None),
                refreshes: AtomicUsize::new(0),
                refreshed_token: 0,
            })
        }
    }

    #[async_trait]
    impl PairingClient for FakePairing {
        async fn load(&self) -> anyhow::Result<Option<ServerCredentials>> {
            Ok(self.creds.lock().clone())
        }

        async fn refresh(
            &self,
            current: &ServerCredentials,
        ) -> anyhow::Result<ServerCredentials> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let mut fresh = current.clone();
            fresh.player_token = self.refreshed_token;
            *self.creds.lock() = Some(fresh.clone());
            Ok(fresh)
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            connect_timeout: Duration::from_millis(500),
            probe_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_millis(200),
            stale_after: Duration::from_secs(120),
            backoff_base: Duration::from_millis(40),
            backoff_cap: Duration::from_millis(200),
            max_attempts: 10,
            info_timeout: Duration::from_millis(200),
        }
    }

    fn chat_sink() -> mpsc::UnboundedSender<TeamMessage> {
        // Receiver dropped on purpose; the manager ignores send failures.
        mpsc::unbounded_channel().0
    }

    async fn wait_for<F: Fn(&StatusSnapshot) -> bool>(handle: &ManagerHandle, pred: F) {
        let mut rx = handle.watch_status();
        let result = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    panic!("manager dropped its status channel");
                }
            }
        })
        .await;
        assert!(result.is_ok(), "status never satisfied predicate");
    }

    /// Poll a plain condition; transient states between polls are allowed
    /// to be missed, only the final state matters.
    async fn poll_until<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ── lifecycle ──────────────────────────────────────────────────

    #[tokio::test]
    async fn idle_until_started() {
        let connector = FakeConnector::new([Script::Accept]);
        let handle = spawn(
            connector.clone(),
            FakePairing::paired(7),
            fast_config(),
            chat_sink(),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(connector.connects(), 0);
        assert!(!handle.status().connected);

        handle.start().await;
        wait_for(&handle, |s| s.connected).await;
        assert_eq!(connector.connects(), 1);
        assert!(handle.session().is_some());
        assert!(handle.status().last_connected.is_some());
    }

    #[tokio::test]
    async fn unpaired_start_stays_idle_with_error() {
        let connector = FakeConnector::new([]);
        let handle = spawn(
            connector.clone(),
            FakePairing::unpaired(),
            fast_config(),
            chat_sink(),
        );

        handle.start().await;
        wait_for(&handle, |s| {
            s.last_error.as_deref() == Some("no server paired")
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.connects(), 0);
        assert!(!handle.status().connected);
    }

    #[tokio::test]
    async fn one_drop_schedules_exactly_one_reconnect() {
        let connector = FakeConnector::new([Script::Accept, Script::Accept]);
        let handle = spawn(
            connector.clone(),
            FakePairing::paired(7),
            fast_config(),
            chat_sink(),
        );
        handle.start().await;
        wait_for(&handle, |s| s.connected).await;

        // Two failure signals from the same dying wire.
        let events = connector.events(0);
        let _ = events.send(SessionEvent::Error("boom".to_string())).await;
        let _ = events.send(SessionEvent::Disconnected).await;

        poll_until("reconnect", || {
            connector.connects() == 2 && handle.status().connected
        })
        .await;

        // Quiesce: no third connect may appear.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn silent_link_is_torn_down_and_rebuilt() {
        let connector = FakeConnector::new([Script::AcceptButMute, Script::Accept]);
        let mut config = fast_config();
        config.probe_interval = Duration::from_millis(30);
        config.stale_after = Duration::from_millis(100);
        let handle = spawn(connector.clone(), FakePairing::paired(7), config, chat_sink());

        handle.start().await;
        // Probes go unanswered; once the silence outlives stale_after the
        // manager replaces the session.
        poll_until("stale link replaced", || {
            connector.connects() == 2 && handle.status().connected
        })
        .await;
    }

    #[tokio::test]
    async fn hung_connect_times_out_and_retries() {
        let connector = FakeConnector::new([Script::Hang, Script::Accept]);
        let mut config = fast_config();
        config.connect_timeout = Duration::from_millis(60);
        let handle = spawn(connector.clone(), FakePairing::paired(7), config, chat_sink());

        handle.start().await;
        poll_until("timed-out connect retried", || {
            connector.connects() == 2 && handle.status().connected
        })
        .await;
        assert!(handle.status().last_error.is_none());
    }

    #[tokio::test]
    async fn session_slot_empties_while_down() {
        let connector = FakeConnector::new([Script::Accept, Script::Accept]);
        let mut config = fast_config();
        config.backoff_base = Duration::from_millis(200);
        let handle = spawn(connector.clone(), FakePairing::paired(7), config, chat_sink());
        handle.start().await;
        wait_for(&handle, |s| s.connected).await;
        assert!(handle.session().is_some());

        let _ = connector.events(0).send(SessionEvent::Disconnected).await;
        wait_for(&handle, |s| !s.connected).await;
        assert!(handle.session().is_none());

        wait_for(&handle, |s| s.connected).await;
        assert!(handle.session().is_some());
    }

    #[tokio::test]
    async fn parks_after_retry_budget_and_resumes_on_start() {
        let connector = FakeConnector::new(vec![Script::Refuse; 20]);
        let mut config = fast_config();
        config.max_attempts = 3;
        config.backoff_base = Duration::from_millis(5);
        config.backoff_cap = Duration::from_millis(10);
        let handle = spawn(connector.clone(), FakePairing::paired(7), config, chat_sink());

        handle.start().await;
        wait_for(&handle, |s| {
            s.last_error.as_deref() == Some("reconnect attempts exhausted")
        })
        .await;
        // Initial attempt plus three retries, then parked.
        assert_eq!(connector.connects(), 4);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.connects(), 4);

        handle.start().await;
        poll_until("resumed connecting", || connector.connects() > 4).await;
    }

    #[tokio::test]
    async fn invalid_session_refreshes_credentials_once() {
        let connector = FakeConnector::new([Script::AcceptButInvalid, Script::Accept]);
        let pairing = FakePairing::paired(7);
        let mut config = fast_config();
        config.probe_interval = Duration::from_millis(40);
        let handle = spawn(connector.clone(), pairing.clone(), config, chat_sink());

        handle.start().await;
        // Probe hits invalid_session, session drops, refresh runs during
        // backoff, second connect uses the fresh token.
        poll_until("refreshed reconnect", || {
            connector.connects() == 2 && handle.status().connected
        })
        .await;

        assert_eq!(pairing.refreshes.load(Ordering::SeqCst), 1);
        let tokens = connector.tokens.lock().clone();
        assert_eq!(tokens, vec![7, 1007]);
    }

    #[tokio::test]
    async fn reported_auth_failure_triggers_refresh() {
        let connector = FakeConnector::new([Script::Accept, Script::Accept]);
        let pairing = FakePairing::paired(7);
        let handle = spawn(connector.clone(), pairing.clone(), fast_config(), chat_sink());

        handle.start().await;
        wait_for(&handle, |s| s.connected).await;

        // The pipeline saw an invalid-session error on its own call.
        handle.note_invalid_session();
        poll_until("refreshed reconnect", || {
            connector.connects() == 2 && handle.status().connected
        })
        .await;

        assert_eq!(pairing.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(connector.tokens.lock().clone(), vec![7, 1007]);
    }

    #[tokio::test]
    async fn start_while_connected_is_a_noop() {
        let connector = FakeConnector::new([Script::Accept]);
        let handle = spawn(
            connector.clone(),
            FakePairing::paired(7),
            fast_config(),
            chat_sink(),
        );
        handle.start().await;
        wait_for(&handle, |s| s.connected).await;

        handle.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.connects(), 1);
        assert!(handle.status().connected);
    }

    #[tokio::test]
    async fn shutdown_clears_the_slot() {
        let connector = FakeConnector::new([Script::Accept]);
        let handle = spawn(
            connector.clone(),
            FakePairing::paired(7),
            fast_config(),
            chat_sink(),
        );
        handle.start().await;
        wait_for(&handle, |s| s.connected).await;

        handle.shutdown().await;
        wait_for(&handle, |s| !s.connected).await;
        assert!(handle.session().is_none());
    }

    #[tokio::test]
    async fn chat_broadcasts_are_forwarded() {
        let connector = FakeConnector::new([Script::Accept]);
        let (chat_tx, mut chat_rx) = mpsc::unbounded_channel();
        let handle = spawn(
            connector.clone(),
            FakePairing::paired(7),
            fast_config(),
            chat_tx,
        );
        handle.start().await;
        wait_for(&handle, |s| s.connected).await;

        let _ = connector
            .events(0)
            .send(SessionEvent::TeamMessage(TeamMessage {
                sender: "jo".to_string(),
                message: "!stock".to_string(),
            }))
            .await;

        let msg = tokio::time::timeout(Duration::from_secs(2), chat_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender, "jo");
        assert_eq!(msg.message, "!stock");
    }
}
