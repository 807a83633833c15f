//! Daemon module — background process that watches a workspace.
//!
//! The daemon keeps a watch session and the incremental baseline alive and
//! serves control requests over a Unix socket, so short-lived CLI calls do
//! not re-scan the workspace every time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           bazelle daemon                │
//! │  - accept loop + one thread per client  │
//! │  - handler (watch state, update seam)   │
//! │  - watcher -> debouncer -> tracker      │
//! └─────────────────────────────────────────┘
//!           ▲
//!           │ .bazelle/daemon.sock (JSON-RPC 2.0, one message per line)
//!           ▼
//! ┌─────────────────────────────────────────┐
//! │       bazelle CLI / editor client       │
//! │  - requests matched to responses by id  │
//! │  - watch/event notifications            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Files under the daemon directory (0700): `daemon.sock` (0600),
//! `daemon.pid` (0600), `daemon.log` and the tracker's `state.json`.

pub mod client;
pub mod control;
pub mod handler;
pub mod lifecycle;
pub mod paths;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod tasks;

pub use client::Client;
pub use control::{spawn_background, stop_daemon, StopOutcome, StopTimeouts};
pub use handler::Handler;
pub use lifecycle::{cleanup_stale, get_status, is_process_running, DaemonStatus};
pub use paths::Paths;
pub use reconnect::{ConnectionState, ReconnectPolicy, ReconnectingClient};
pub use server::{ClientConn, ClientRegistry, Server};
pub use tasks::{ShutdownSignal, TaskGroup};
