//! # redostream - redo-log change data capture
//!
//! Tails a relational database's redo-log stream, reassembles committed
//! row-level changes, and publishes them as ordered, structured messages
//! to a sink with at-least-once delivery and durable checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! Reader ──> Parser ──> TxBuf ──(commit)──> Builder ──> Ring ──> Writer ──> Sink
//!               │          │                                │
//!               │          └── MemMgr (swap to disk) ───────┘
//!               └────────────── Checkpoint (position + schema + XIDs)
//! ```
//!
//! The pipeline runs on preemptive OS threads with explicit condvar
//! coordination. Memory comes from a fixed-chunk arena with per-module
//! quotas; large in-flight transactions spill to disk under pressure; the
//! builder-to-writer ring carries framed messages published with
//! release/acquire atomics.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redostream::config::Config;
//! use redostream::supervisor::Supervisor;
//!
//! # fn main() -> redostream::Result<()> {
//! let handle = Config::load("redostream.json")?;
//! let supervisor = Supervisor::new(&handle)?;
//! supervisor.run()
//! # }
//! ```

pub mod builder;
pub mod common;
pub mod config;
pub mod memory;
pub mod metadata;
pub mod parser;
pub mod reader;
pub mod ring;
pub mod supervisor;
pub mod txbuf;
pub mod writer;

pub use common::{Ctx, Error, Result, Scn, Xid};
pub use config::Config;
pub use supervisor::Supervisor;
