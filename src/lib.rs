//! ioduel - storage interference benchmark harness
//!
//! ioduel evaluates how much performance a key-value store loses when it has
//! to share a storage device with concurrent synthetic I/O load. It ships two
//! binaries built on this library:
//!
//! - **blkload**: a raw block-level load generator with a selectable I/O
//!   engine (blocking POSIX, kernel AIO, thread-pool `preadv`/`pwritev2`),
//!   runtime-mutable parameters, periodic structured stats and a
//!   stdin/socket control surface.
//! - **ioduel**: the experiment supervisor. It launches N workload
//!   containers (KV benchmarks, client simulators, raw loaders), parses
//!   their stdout into time-aligned metric records, serves a command socket
//!   with scheduling and cancellation, and coordinates shutdown.
//!
//! # Architecture
//!
//! - **Engines**: one tagged variant per kernel interface, all driven by a
//!   single controller thread that owns the workload file
//! - **Access planning**: bernoulli read/write and random/sequential draws,
//!   with a generation bitmap keeping random offsets collision-free
//! - **Reporting**: per-interval deltas of monotonic counters, phase-shifted
//!   on request so reports from all instances line up in time
//! - **Supervision**: long-lived child processes wrapped as tasks, a shared
//!   clock, and a line-based command mini-language over a Unix socket

pub mod bitmap;
pub mod config;
pub mod control;
pub mod engine;
pub mod params;
pub mod random;
pub mod report;
pub mod stats;
pub mod supervisor;
pub mod util;

pub use params::EngineParams;
pub use stats::Stats;

/// Result type used throughout ioduel
pub type Result<T> = anyhow::Result<T>;
