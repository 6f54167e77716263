//! # Meshtrack - position gossip over a shared serial mesh
//!
//! Every unit on the mesh periodically broadcasts its own position over a shared
//! UART radio link, listens for the broadcasts of its peers and keeps a live table
//! of neighbor positions for dashboards.
//!
//! ## Features
//!
//! - **Streaming frame scanner**: `S<id>;<x>;<y>[;<dBm>]E` frames reassembled from
//!   arbitrary read fragments, with a bounded receive buffer.
//! - **Duplicate suppression**: time-windowed, capacity-bounded filter keyed on
//!   sender and position.
//! - **Neighbor table**: consistent snapshots under concurrent reads, optional
//!   eviction of silent peers.
//! - **Viewer push**: JSON events over WebSocket on every change.
//! - **Snapshot file**: atomic JSON dump of the latest state.
//! - **Async design**: independent Tokio tasks with cooperative shutdown.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshtrack::config::Config;
//! use meshtrack::node::MeshNode;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let node = MeshNode::start(config).await?;
//!     node.run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`mesh`] - frame codec, duplicate filter, neighbor table and the engine loops
//! - [`viewer`] - WebSocket push endpoint for live viewers
//! - [`storage`] - snapshot file and single-instance lock
//! - [`config`] - configuration loading and validation
//! - [`node`] - startup wiring and signal handling
//! - [`metrics`] - per-engine frame counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Mesh Node     │ ← lock, transport, signals
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Mesh Engine   │ ← transmit / receive / report / persist tasks
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Viewer & Storage│ ← publish and persist collaborators
//! └─────────────────┘
//! ```

pub mod config;
pub mod logutil;
pub mod mesh;
pub mod metrics;
pub mod node;
pub mod storage;
pub mod viewer;
