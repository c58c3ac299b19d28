//! Session controller for a Shadowsocks client: decodes `ss://` links, keeps
//! profiles and subscriptions, supervises the external `sslocal` process and
//! layers latency and geo status on top of it.

pub mod cli;
pub mod error;
pub mod install;
pub mod link;
pub mod probe;
pub mod session;
pub mod store;
pub mod subscription;
pub mod supervisor;

pub use error::{DecodeError, Error, Result, StoreError, SupervisorError};
pub use link::ServerProfile;
pub use probe::{GeoInfo, ProbeKind, ProbeResult};
pub use session::{
    Latency, ProxySession, SessionConfig, SessionEvent, SessionHandle, SessionSnapshot,
    SessionState,
};
pub use store::{ExportBundle, Settings, Store, Subscription};
pub use subscription::{FetchResult, SubscriptionQuota};
pub use supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorEvent};

/// Command-line entry point.
pub fn run() {
    cli::run()
}
