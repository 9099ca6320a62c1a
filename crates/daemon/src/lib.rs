//! # termrooms
//!
//! A daemon that runs interactive terminal sessions, local pseudo-terminals
//! or ssh logins, and multiplexes their output into shared rooms.
//!
//! ## Overview
//!
//! - **Sessions**: each session wraps one interactive driver. A drain loop
//!   reads its output, runs it through the output filter, records it as
//!   history and publishes it to the session's room.
//! - **Registry**: owns every session by id, enforces capacity, and fans
//!   input out to several sessions at once.
//! - **Rooms**: observers join a session's room and receive its history
//!   followed by live output.
//! - **IPC**: the CLI and other local observers talk to the daemon over a
//!   Unix socket using newline-delimited JSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                   Daemon Orchestrator                     │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │  IPC Server  │──▶│   Session    │──▶│     Room      │  │
//! │  │              │   │   Registry   │   │  Broadcaster  │  │
//! │  └──────────────┘   └──────────────┘   └───────────────┘  │
//! │                            │                              │
//! │               ┌────────────┴────────────┐                 │
//! │        ┌──────────────┐         ┌──────────────┐          │
//! │        │ Local (PTY)  │         │ Remote (ssh) │          │
//! │        └──────────────┘         └──────────────┘          │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termrooms::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let socket_path = termrooms::ipc::get_socket_path();
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config, socket_path);
//!     orchestrator.start().await?;
//!
//!     // Serve until a client sends `Stop`.
//!     orchestrator.shutdown_token().cancelled().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`filter`]: Output rewrite rules
//! - [`session`]: Drivers, sessions, the registry and rooms
//! - [`ipc`]: Unix socket protocol between the CLI and the daemon
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod filter;
pub mod ipc;
pub mod orchestrator;
pub mod session;

pub use config::Config;

pub use filter::{FilterRule, OutputFilter};

pub use session::{
    Broadcaster, DriverParams, RoomBroadcaster, RoomEvent, Session, SessionError, SessionId,
    SessionRegistry, SessionState, SessionSummary,
};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
