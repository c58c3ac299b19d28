//! Lifecycle of the external `sslocal` process.
//!
//! The supervisor is owned by a single task. Background helpers (output
//! readers, the exit monitor and the startup timer) never touch it directly;
//! they post [`ProcessSignal`]s that the owner feeds back through
//! [`ProcessSupervisor::handle_signal`]. Every helper is tagged with the watch
//! token of the process it belongs to, and bumping the token retires them.
//!
//! Per process: `Idle -> Starting -> (Running | failed)`, `Running -> (stopped
//! | crashed)`, every outcome returns to `Idle`. `Starting -> Running` is only
//! decided when the startup timer fires.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::SupervisorError;
use crate::install;
use crate::link::ServerProfile;

pub const DEFAULT_PROGRAM: &str = "sslocal";
const LOCAL_HOST: &str = "127.0.0.1";
const REDACTED: &str = "********";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Executable name or path, resolved against `PATH`.
    pub program: String,
    /// Arguments placed before the generated ones, for wrappers such as
    /// `firejail --quiet sslocal`.
    pub launch_prefix: Vec<String>,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            launch_prefix: Vec::new(),
            startup_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(750),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    Idle,
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Notification from a background helper. Opaque to everyone but the supervisor.
#[derive(Debug)]
pub struct ProcessSignal {
    token: u64,
    kind: SignalKind,
}

#[derive(Debug)]
enum SignalKind {
    Output { stream: OutputStream, line: String },
    Poll,
    StartupElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Log(String),
    Connected,
    StartFailed { exit_code: Option<i32> },
    ConnectionLost { exit_code: Option<i32> },
    Disconnected { message: String },
}

/// `-s host:port -b 127.0.0.1:port -m method -k password -U`
pub fn proxy_args(profile: &ServerProfile, local_port: u16) -> Vec<String> {
    vec![
        "-s".to_string(),
        profile.endpoint(),
        "-b".to_string(),
        format!("{LOCAL_HOST}:{local_port}"),
        "-m".to_string(),
        profile.method().to_string(),
        "-k".to_string(),
        profile.password().to_string(),
        "-U".to_string(),
    ]
}

/// Copy of `args` with the value following `-k` masked.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut redacted = args.to_vec();
    for i in 1..redacted.len() {
        if args[i - 1] == "-k" {
            redacted[i] = REDACTED.to_string();
        }
    }
    redacted
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("Process exited with code {code}"),
        None => "Process terminated by signal".to_string(),
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    signals: mpsc::UnboundedSender<ProcessSignal>,
    child: Option<Child>,
    phase: ProcessPhase,
    last_exit: Option<i32>,
    watch_token: Arc<AtomicU64>,
    #[cfg(windows)]
    job: Option<job::JobHandle>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> (Self, mpsc::UnboundedReceiver<ProcessSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            config,
            signals,
            child: None,
            phase: ProcessPhase::Idle,
            last_exit: None,
            watch_token: Arc::new(AtomicU64::new(0)),
            #[cfg(windows)]
            job: None,
        };
        (supervisor, rx)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn phase(&self) -> ProcessPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != ProcessPhase::Idle || self.child.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn last_exit(&self) -> Option<i32> {
        self.last_exit
    }

    /// Resolves the proxy executable without spawning anything.
    pub fn check_installed(&self) -> Result<PathBuf, SupervisorError> {
        install::locate_executable(&self.config.program).ok_or_else(|| {
            SupervisorError::NotInstalled {
                program: self.config.program.clone(),
                hint: install::install_hint(),
            }
        })
    }

    fn current_token(&self) -> u64 {
        self.watch_token.load(Ordering::SeqCst)
    }

    fn bump_token(&self) -> u64 {
        self.watch_token.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Spawns the proxy for `profile`, stopping any previous process first.
    /// Success here only means the process was launched; the verdict comes
    /// later as `Connected` or `StartFailed`.
    pub async fn start(
        &mut self,
        profile: &ServerProfile,
        local_port: u16,
    ) -> Result<Vec<SupervisorEvent>, SupervisorError> {
        let exe = self.check_installed()?;

        let mut events = Vec::new();
        if self.is_active() {
            events.extend(self.stop().await);
        }

        let args = proxy_args(profile, local_port);
        let shown: Vec<String> = std::iter::once(self.config.program.clone())
            .chain(self.config.launch_prefix.iter().cloned())
            .chain(redact_args(&args))
            .collect();
        let shown = shown.join(" ");
        log::info!("starting: {shown}");
        events.push(SupervisorEvent::Log(format!("Starting: {shown}")));

        let mut cmd = Command::new(&exe);
        cmd.args(&self.config.launch_prefix)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;

        #[cfg(windows)]
        self.attach_job(&child);

        let token = self.bump_token();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, token, self.signals.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, token, self.signals.clone());
        }
        log::debug!("spawned pid {:?} with watch token {token}", child.id());

        self.child = Some(child);
        self.phase = ProcessPhase::Starting;
        self.last_exit = None;
        self.spawn_startup_timer(token);
        self.spawn_monitor(token);
        Ok(events)
    }

    /// Terminates the process (graceful, then forced after the grace period).
    /// No-op when idle.
    pub async fn stop(&mut self) -> Vec<SupervisorEvent> {
        if !self.is_active() {
            return Vec::new();
        }
        self.bump_token();
        self.phase = ProcessPhase::Idle;

        let mut events = Vec::new();
        if let Some(mut child) = self.child.take() {
            events.push(SupervisorEvent::Log("Disconnecting...".to_string()));
            if terminate(&mut child, self.config.stop_grace).await {
                log::warn!("proxy ignored termination, killed");
                events.push(SupervisorEvent::Log("Force killing process...".to_string()));
            }
            if let Ok(Some(status)) = child.try_wait() {
                self.last_exit = status.code();
            }
        }
        log::info!("proxy stopped");
        events.push(SupervisorEvent::Disconnected {
            message: "Disconnected".to_string(),
        });
        events
    }

    pub fn handle_signal(&mut self, signal: ProcessSignal) -> Vec<SupervisorEvent> {
        if signal.token != self.current_token() {
            return Vec::new();
        }
        match signal.kind {
            SignalKind::Output { stream, line } => {
                log::debug!("sslocal {stream:?}: {line}");
                let line = match stream {
                    OutputStream::Stdout => line,
                    OutputStream::Stderr => format!("Error: {line}"),
                };
                vec![SupervisorEvent::Log(line)]
            }
            SignalKind::Poll => self.on_poll(),
            SignalKind::StartupElapsed => self.on_startup_elapsed(),
        }
    }

    /// Collects the exit status if the child has finished.
    fn reap(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        let code = match child.try_wait() {
            Ok(Some(status)) => status.code(),
            Ok(None) => return None,
            Err(e) => {
                log::warn!("lost track of proxy process: {e}");
                Some(-1)
            }
        };
        self.child = None;
        self.last_exit = code;
        Some(code)
    }

    fn on_poll(&mut self) -> Vec<SupervisorEvent> {
        match self.phase {
            ProcessPhase::Idle => Vec::new(),
            // Early exits are recorded but judged when the startup timer fires.
            ProcessPhase::Starting => match self.reap() {
                Some(code) => vec![SupervisorEvent::Log(describe_exit(code))],
                None => Vec::new(),
            },
            ProcessPhase::Running => {
                let Some(code) = self.reap() else {
                    return Vec::new();
                };
                self.phase = ProcessPhase::Idle;
                self.bump_token();

                let mut events = vec![SupervisorEvent::Log(describe_exit(code))];
                if code != Some(0) {
                    log::warn!("proxy crashed: {}", describe_exit(code));
                    events.push(SupervisorEvent::ConnectionLost { exit_code: code });
                }
                events.push(SupervisorEvent::Disconnected {
                    message: "Disconnected".to_string(),
                });
                events
            }
        }
    }

    fn on_startup_elapsed(&mut self) -> Vec<SupervisorEvent> {
        if self.phase != ProcessPhase::Starting {
            return Vec::new();
        }
        let mut events = Vec::new();
        if let Some(code) = self.reap() {
            events.push(SupervisorEvent::Log(describe_exit(code)));
        }

        if self.child.is_some() {
            self.phase = ProcessPhase::Running;
            log::info!("proxy running (pid {:?})", self.pid());
            events.push(SupervisorEvent::Connected);
        } else {
            self.phase = ProcessPhase::Idle;
            self.bump_token();
            log::warn!("proxy failed to start: {}", describe_exit(self.last_exit));
            events.push(SupervisorEvent::StartFailed {
                exit_code: self.last_exit,
            });
        }
        events
    }

    fn spawn_startup_timer(&self, token: u64) {
        let signals = self.signals.clone();
        let watch = self.watch_token.clone();
        let timeout = self.config.startup_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if watch.load(Ordering::SeqCst) == token {
                let _ = signals.send(ProcessSignal {
                    token,
                    kind: SignalKind::StartupElapsed,
                });
            }
        });
    }

    fn spawn_monitor(&self, token: u64) {
        let signals = self.signals.clone();
        let watch = self.watch_token.clone();
        let interval = self.config.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if watch.load(Ordering::SeqCst) != token {
                    return;
                }
                let poll = ProcessSignal {
                    token,
                    kind: SignalKind::Poll,
                };
                if signals.send(poll).is_err() {
                    return;
                }
            }
        });
    }

    #[cfg(windows)]
    fn attach_job(&mut self, child: &Child) {
        if self.job.is_none() {
            match job::JobHandle::create() {
                Ok(handle) => self.job = Some(handle),
                Err(e) => log::warn!("job object unavailable: {e}"),
            }
        }
        if let (Some(job), Some(raw)) = (self.job.as_ref(), child.raw_handle()) {
            job.assign(raw as isize);
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Retire helpers; the child itself is killed on drop.
        self.bump_token();
    }
}

fn spawn_reader<R>(reader: R, stream: OutputStream, token: u64, signals: mpsc::UnboundedSender<ProcessSignal>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            let output = ProcessSignal {
                token,
                kind: SignalKind::Output { stream, line },
            };
            if signals.send(output).is_err() {
                return;
            }
        }
    });
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to our own child.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}

/// Returns true when the process had to be force-killed.
async fn terminate(child: &mut Child, grace: Duration) -> bool {
    if let Ok(Some(_)) = child.try_wait() {
        return false;
    }
    request_exit(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => false,
        Err(_) => {
            if let Err(e) = child.kill().await {
                log::warn!("force kill failed: {e}");
            }
            true
        }
    }
}

#[cfg(windows)]
mod job {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    /// Job object that kills its processes when the last handle closes, so
    /// the proxy cannot outlive the application.
    #[derive(Debug)]
    pub(super) struct JobHandle(HANDLE);

    impl Drop for JobHandle {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    impl JobHandle {
        pub(super) fn create() -> std::io::Result<Self> {
            let handle = unsafe { CreateJobObjectW(std::ptr::null_mut(), std::ptr::null()) };
            if handle == 0 {
                return Err(std::io::Error::last_os_error());
            }
            let job = JobHandle(handle);
            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            let result = unsafe {
                SetInformationJobObject(
                    job.0,
                    JobObjectExtendedLimitInformation,
                    &mut info as *mut _ as *mut _,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
            };
            if result == 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(job)
        }

        pub(super) fn assign(&self, process: HANDLE) {
            let ok = unsafe { AssignProcessToJobObject(self.0, process) };
            if ok == 0 {
                log::warn!(
                    "assign to job object failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}
