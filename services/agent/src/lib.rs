//! berth node agent library
//!
//! The agent supervises containers on one node. It turns RPCs into runtime
//! calls and keeps each container's task in the status the caller asked for.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API (api) ──► Supervisor ──► Runtime (containers, snapshots, tasks, content)
//!                       ▲  │
//!       Reconciler ─────┘  └──► NetworkBinder, DesiredStateStore, Peer (migrate)
//! ```
//!
//! ## Modules
//!
//! - `supervisor`: lifecycle, pause guard, checkpoint and restore
//! - `migrate`: moving a container to another agent
//! - `reconciler`: the periodic desired/observed convergence loop
//! - `runtime`: the runtime collaborator and its in-memory implementation
//! - `network`: per-container network attachment
//! - `state`: the desired-state table

pub mod api;
pub mod client;
pub mod config;
pub mod container;
pub mod error;
pub mod migrate;
pub mod network;
pub mod reconciler;
pub mod runtime;
pub mod state;
pub mod supervisor;

pub use client::AgentClient;
pub use container::Container;
pub use error::{AgentError, AgentResult};
pub use migrate::{MigrateRequest, Peer, PeerConnector};
pub use reconciler::{ReconcileStats, Reconciler, ReconcilerConfig};
pub use runtime::{MemoryRegistry, MemoryRuntime, Runtime};
pub use state::DesiredStateStore;
pub use supervisor::{ContainerInfo, Supervisor, SupervisorConfig};
