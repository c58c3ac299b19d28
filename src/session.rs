//! Session controller.
//!
//! One task owns the [`ProcessSupervisor`] and the [`ProxySession`]. User
//! requests, process signals, timer expiries and probe results all arrive on
//! its mailboxes and are applied one at a time, so the session is never
//! mutated concurrently. Observers get ordered [`SessionEvent`]s over a
//! broadcast channel and the latest [`SessionSnapshot`] over a watch channel.
//!
//! Every connect attempt runs under an epoch. Timers and probes carry the
//! epoch they were started in and their results are dropped once it changes.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::link::ServerProfile;
use crate::probe::{self, GeoInfo};
use crate::supervisor::{
    ProcessSignal, ProcessSupervisor, SupervisorConfig, SupervisorEvent,
};

pub const DEFAULT_LOCAL_PORT: u16 = 1080;
pub const LATENCY_TARGET: &str = "google.com";
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_port: u16,
    /// Immediate restarts after a failed start before giving up.
    pub max_retries: u32,
    pub latency_interval: Duration,
    pub latency_target: String,
    pub geo_settle_delay: Duration,
    /// Stop showing "Connecting..." after this long even without geo data.
    pub geo_fallback: Duration,
    /// Pause between disconnect and reconnect when switching profiles.
    pub switch_delay: Duration,
    pub http_timeout: Duration,
    pub geo_timeout: Duration,
    pub supervisor: SupervisorConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_LOCAL_PORT,
            max_retries: 3,
            latency_interval: Duration::from_secs(5),
            latency_target: LATENCY_TARGET.to_string(),
            geo_settle_delay: Duration::from_secs(2),
            geo_fallback: Duration::from_secs(10),
            switch_delay: Duration::from_millis(500),
            http_timeout: probe::HTTP_TIMEOUT,
            geo_timeout: probe::GEO_TIMEOUT,
            supervisor: SupervisorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Latency {
    #[default]
    Unknown,
    Measured(u32),
    Failed,
}

/// Run-time connection state. `Connected` implies `bound_profile` is set.
#[derive(Debug, Clone, Default)]
pub struct ProxySession {
    pub state: SessionState,
    pub bound_profile: Option<ServerProfile>,
    pub local_port: u16,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Session plus the display data layered on top of it.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub session: ProxySession,
    pub latency: Latency,
    pub geo: Option<GeoInfo>,
    pub awaiting_geo: bool,
    pub pid: Option<u32>,
}

impl SessionSnapshot {
    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn status_label(&self) -> String {
        match self.session.state {
            SessionState::Disconnected if self.session.last_error.is_some() => "Error".to_string(),
            SessionState::Disconnected => "Disconnected".to_string(),
            SessionState::Connecting => "Connecting...".to_string(),
            SessionState::Connected => match &self.geo {
                Some(geo) => format!("{} {}", geo.flag, geo.ip),
                None if self.awaiting_geo => "Connecting...".to_string(),
                None => "Connected".to_string(),
            },
        }
    }

    pub fn latency_label(&self) -> String {
        match self.latency {
            Latency::Unknown => "Ping: --".to_string(),
            Latency::Measured(ms) => format!("Ping: {ms} ms"),
            Latency::Failed => "Ping: Error".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        profile: Option<ServerProfile>,
    },
    /// User-facing message; errors are the prominent ones.
    Notice { message: String, is_error: bool },
    Log(String),
    Latency(Latency),
    Geo(GeoInfo),
    /// Emitted whenever `status_label()` changes.
    Status(String),
}

enum Command {
    Connect(ServerProfile),
    Disconnect,
    Select(ServerProfile),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
enum Internal {
    Reconnect { epoch: u64, profile: ServerProfile },
    Latency { epoch: u64, latency_ms: Option<u32> },
    Geo { epoch: u64, info: Option<GeoInfo> },
    GeoFallback { epoch: u64 },
}

struct Controller {
    config: SessionConfig,
    supervisor: ProcessSupervisor,
    snapshot: SessionSnapshot,
    epoch: u64,
    tasks: Vec<JoinHandle<()>>,
    internal: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<SessionEvent>,
    published: watch::Sender<SessionSnapshot>,
    last_label: String,
}

impl Controller {
    fn new(
        config: SessionConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ProcessSignal>,
        mpsc::UnboundedReceiver<Internal>,
    ) {
        let (supervisor, signals) = ProcessSupervisor::new(config.supervisor.clone());
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let snapshot = SessionSnapshot {
            session: ProxySession {
                local_port: config.local_port,
                ..ProxySession::default()
            },
            ..SessionSnapshot::default()
        };
        let last_label = snapshot.status_label();
        let (published, _) = watch::channel(snapshot.clone());
        let controller = Self {
            config,
            supervisor,
            snapshot,
            epoch: 0,
            tasks: Vec::new(),
            internal,
            events,
            published,
            last_label,
        };
        (controller, signals, internal_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.disconnect().await;
                        self.publish();
                        let _ = ack.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(signal) = signals.recv() => self.on_signal(signal).await,
                Some(message) = internal.recv() => self.on_internal(message).await,
            }
            self.publish();
        }
        log::debug!("all session handles dropped, stopping proxy");
        self.disconnect().await;
        self.publish();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(profile) => self.connect(profile).await,
            Command::Disconnect => self.disconnect().await,
            Command::Select(profile) => self.select(profile).await,
            Command::Shutdown(_) => {}
        }
    }

    async fn on_signal(&mut self, signal: ProcessSignal) {
        let events = self.supervisor.handle_signal(signal);
        self.apply(events).await;
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn notice(&self, message: impl Into<String>, is_error: bool) {
        self.emit(SessionEvent::Notice {
            message: message.into(),
            is_error,
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.snapshot.session.state == state {
            return;
        }
        log::info!("session {:?} -> {state:?}", self.snapshot.session.state);
        self.snapshot.session.state = state;
        self.emit(SessionEvent::StateChanged {
            state,
            profile: self.snapshot.session.bound_profile.clone(),
        });
    }

    fn publish(&mut self) {
        self.snapshot.pid = self.supervisor.pid();
        let label = self.snapshot.status_label();
        if label != self.last_label {
            self.last_label = label.clone();
            self.emit(SessionEvent::Status(label));
        }
        self.published.send_replace(self.snapshot.clone());
    }

    fn clear_binding(&mut self) {
        let session = &mut self.snapshot.session;
        session.bound_profile = None;
        session.retry_count = 0;
        self.snapshot.latency = Latency::Unknown;
        self.snapshot.geo = None;
        self.snapshot.awaiting_geo = false;
    }

    fn cancel_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.epoch += 1;
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.snapshot.session.state == SessionState::Connected
    }

    async fn connect(&mut self, profile: ServerProfile) {
        let session = &self.snapshot.session;
        if session.state != SessionState::Disconnected
            && session.bound_profile.as_ref() == Some(&profile)
        {
            log::debug!("already bound to {}", profile.name());
            return;
        }

        if let Err(e) = self.supervisor.check_installed() {
            log::error!("{e}");
            self.snapshot.session.last_error = Some(e.to_string());
            self.notice(e.to_string(), true);
            return;
        }

        // The old process must release the local port first.
        self.cancel_tasks();
        let events = self.supervisor.stop().await;
        self.apply(events).await;

        self.clear_binding();
        self.snapshot.session.last_error = None;
        self.snapshot.session.bound_profile = Some(profile.clone());
        self.set_state(SessionState::Connecting);
        log::info!("connecting to {} ({})", profile.name(), profile.endpoint());

        match self
            .supervisor
            .start(&profile, self.snapshot.session.local_port)
            .await
        {
            Ok(events) => self.apply(events).await,
            Err(e) => self.fail(e.to_string()),
        }
    }

    async fn disconnect(&mut self) {
        self.cancel_tasks();
        let events = self.supervisor.stop().await;
        self.snapshot.session.last_error = None;
        self.apply(events).await;
        self.clear_binding();
        self.set_state(SessionState::Disconnected);
    }

    async fn select(&mut self, profile: ServerProfile) {
        let session = &self.snapshot.session;
        if session.state == SessionState::Disconnected
            || session.bound_profile.as_ref() == Some(&profile)
        {
            return;
        }
        log::info!("switching to {}", profile.name());
        self.disconnect().await;

        let epoch = self.epoch;
        let delay = self.config.switch_delay;
        let tx = self.internal.clone();
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Reconnect { epoch, profile });
        }));
    }

    fn fail(&mut self, message: String) {
        log::error!("{message}");
        self.cancel_tasks();
        self.snapshot.session.last_error = Some(message.clone());
        self.notice(message, true);
        self.clear_binding();
        self.set_state(SessionState::Disconnected);
    }

    async fn apply(&mut self, events: Vec<SupervisorEvent>) {
        let mut queue = VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            match event {
                SupervisorEvent::Log(line) => self.emit(SessionEvent::Log(line)),
                SupervisorEvent::Connected => self.on_connected(),
                SupervisorEvent::StartFailed { exit_code } => {
                    queue.extend(self.on_start_failed(exit_code).await);
                }
                SupervisorEvent::ConnectionLost { exit_code } => {
                    let message = match exit_code {
                        Some(code) => format!("Connection lost (exit code {code})"),
                        None => "Connection lost".to_string(),
                    };
                    log::warn!("{message}");
                    self.snapshot.session.last_error = Some(message.clone());
                    self.notice(message, true);
                }
                SupervisorEvent::Disconnected { message } => {
                    self.cancel_tasks();
                    self.clear_binding();
                    self.set_state(SessionState::Disconnected);
                    self.notice(message, false);
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if self.snapshot.session.state != SessionState::Connecting {
            return;
        }
        self.snapshot.session.retry_count = 0;
        self.snapshot.awaiting_geo = true;
        self.set_state(SessionState::Connected);
        if let Some(profile) = &self.snapshot.session.bound_profile {
            self.notice(format!("Connected to {}", profile.name()), false);
        }
        self.start_probes();
    }

    /// Retries within the bound, otherwise gives up. Returns the events of
    /// the new attempt.
    async fn on_start_failed(&mut self, exit_code: Option<i32>) -> Vec<SupervisorEvent> {
        let Some(profile) = self.snapshot.session.bound_profile.clone() else {
            return Vec::new();
        };
        let max = self.config.max_retries;
        if self.snapshot.session.retry_count >= max {
            let detail = match exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated".to_string(),
            };
            let message = if max == 0 {
                format!("Failed to start proxy ({detail})")
            } else {
                format!("Failed to start proxy after {max} retries ({detail})")
            };
            self.fail(message);
            return Vec::new();
        }

        self.snapshot.session.retry_count += 1;
        let line = format!("Retry attempt {}/{max}", self.snapshot.session.retry_count);
        log::info!("{line}");
        self.emit(SessionEvent::Log(line));
        match self
            .supervisor
            .start(&profile, self.snapshot.session.local_port)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                self.fail(e.to_string());
                Vec::new()
            }
        }
    }

    fn start_probes(&mut self) {
        let epoch = self.epoch;
        let port = self.snapshot.session.local_port;

        let tx = self.internal.clone();
        let target = self.config.latency_target.clone();
        let every = self.config.latency_interval;
        let timeout = self.config.http_timeout;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let latency_ms = probe::http_probe_via_socks5(&target, port, timeout).await;
                if tx.send(Internal::Latency { epoch, latency_ms }).is_err() {
                    return;
                }
            }
        }));

        let tx = self.internal.clone();
        let settle = self.config.geo_settle_delay;
        let timeout = self.config.geo_timeout;
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let info = probe::geo_probe_via_socks5(port, timeout).await;
            let _ = tx.send(Internal::Geo { epoch, info });
        }));

        let tx = self.internal.clone();
        let fallback = self.config.geo_fallback;
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(fallback).await;
            let _ = tx.send(Internal::GeoFallback { epoch });
        }));
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Reconnect { epoch, profile } => {
                if epoch == self.epoch && self.snapshot.session.state == SessionState::Disconnected {
                    self.connect(profile).await;
                }
            }
            Internal::Latency { epoch, latency_ms } => {
                if !self.is_current(epoch) {
                    log::debug!("dropping stale latency result");
                    return;
                }
                let latency = match latency_ms {
                    Some(ms) => Latency::Measured(ms),
                    None => Latency::Failed,
                };
                self.snapshot.latency = latency;
                self.emit(SessionEvent::Latency(latency));
            }
            Internal::Geo { epoch, info } => {
                if !self.is_current(epoch) {
                    log::debug!("dropping stale geo result");
                    return;
                }
                match info {
                    Some(info) => {
                        self.snapshot.awaiting_geo = false;
                        self.snapshot.geo = Some(info.clone());
                        self.emit(SessionEvent::Geo(info));
                    }
                    None => log::debug!("geo probe returned nothing"),
                }
            }
            Internal::GeoFallback { epoch } => {
                if self.is_current(epoch) {
                    self.snapshot.awaiting_geo = false;
                }
            }
        }
    }
}

/// Cloneable front door to the controller task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

/// Starts the controller task on the current tokio runtime.
pub fn spawn(config: SessionConfig) -> SessionHandle {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (controller, signals, internal) = Controller::new(config, events.clone());
    let snapshot = controller.published.subscribe();
    tokio::spawn(controller.run(commands_rx, signals, internal));
    SessionHandle {
        commands,
        events,
        snapshot,
    }
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::SessionClosed)
    }

    pub fn connect(&self, profile: ServerProfile) -> Result<()> {
        self.send(Command::Connect(profile))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Picks `profile` as the active one. While connected to another profile
    /// this disconnects and reconnects after the switch delay.
    pub fn select(&self, profile: ServerProfile) -> Result<()> {
        self.send(Command::Select(profile))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Stops the proxy and ends the controller task.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Shutdown(ack))?;
        done.await.map_err(|_| Error::SessionClosed)
    }
}
