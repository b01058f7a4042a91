//! Deploy panel — fetch, run and watch a single user program.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Operator │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (browser)│ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (log stream, terminal input)       │
//!                       │         │                                        │
//!                       │         │ DeployPipeline::trigger()              │
//!                       │         v                                        │
//!                       │  pipeline.rs  (DeployPipeline, DeployStage list) │
//!                       │         │                                        │
//!                       │         │ SourceFetcher::materialize()           │
//!                       │         │ ProcessSupervisor::start()/stop()      │
//!                       │         v                                        │
//!                       │  supervisor.rs  (single process slot)            │
//!                       │         │                                        │
//!                       │         │ stdout/stderr lines                    │
//!                       │         v                                        │
//!                       │  logbuf.rs  (LogBroadcast ring + fan-out)        │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module           | Responsibility                                       |
//! |------------------|------------------------------------------------------|
//! | `models`         | Shared types: `LogEntry`, `DeployRequest`, `FileEntry` |
//! | `sandbox`        | `WorkspaceSandbox` — confines client paths to the root |
//! | `files`          | `FileManager` — list / upload / delete               |
//! | `fetch`          | `SourceFetcher` trait, archive extraction, git clone |
//!
//! ## Typical Request Flow (archive deploy)
//!
//! 1. `POST /deploy/zip` stages the upload under the staging directory and
//!    answers `202 Accepted` at once.
//! 2. `DeployPipeline` runs its stages in order: stop the old process, empty
//!    the workspace, extract the archive, optionally run the install command,
//!    start the run command, remove the staged archive.
//! 3. Every stage and every output line of the child becomes a `LogEntry`,
//!    broadcast to all `/ws` observers.

pub mod api;
pub mod fetch;
pub mod files;
pub mod logbuf;
pub mod models;
pub mod pipeline;
pub mod sandbox;
pub mod server;
pub mod supervisor;
pub mod ws;
