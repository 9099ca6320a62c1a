//! Session management.
//!
//! A session wraps one interactive driver (a local PTY process or an ssh
//! login), records its filtered output, and publishes that output to the
//! session's room. The registry maps ids to sessions under a capacity limit.

pub mod driver;
pub mod interactive;
pub mod multiplexer;
pub mod pty;
pub mod registry;
pub mod remote;

pub use driver::{
    build_driver, DriverDefaults, DriverError, DriverFactory, DriverKind, DriverParams,
    InteractiveDriver, PtyDriverFactory,
};
pub use interactive::{
    DrainSettings, Session, SessionError, SessionId, SessionState, SessionSummary,
};
pub use multiplexer::{
    Broadcaster, ClientHandle, ClientId, ClientStats, NullBroadcaster, RoomBroadcaster, RoomEvent,
};
pub use pty::LocalDriver;
pub use registry::{BroadcastReport, RegistrySettings, SessionRegistry, SkippedTarget};
pub use remote::{RemoteDriver, RemoteSettings};
