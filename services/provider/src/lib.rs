//! devfarm provider library
//!
//! The provider runs on every host of the device farm. It discovers the
//! devices attached to the host, keeps one worker process running per usable
//! device and reports device status to the rest of the farm.
//!
//! ## Architecture
//!
//! ```text
//! DeviceTracker ──events──▶ DeviceRouter ──report──▶ StatusPublisher
//!                                │
//!                                ▼
//!                           Supervisor ──spawn──▶ WorkerSpawner
//!                           (registry)  ◀─exit/error── worker watchers
//!                                │
//!                                ▼
//!                        termination tasks (SIGTERM, then SIGKILL)
//! ```
//!
//! A single task ([`provider::Provider`]) owns the router and supervisor, so
//! the registry has exactly one writer.
//!
//! ## Modules
//!
//! - `device`: device model and wanted-device filters
//! - `process`: worker process handles and spawners
//! - `supervisor`: worker registry, exit classification and restarts
//! - `shutdown`: two-phase termination and the all-workers drain
//! - `router`: device event routing
//! - `status`: status reports and publishers
//! - `tracker`: device event sources
//! - `provider`: the supervision loop
//! - `config`, `signals`: startup configuration and host shutdown signals

pub mod config;
pub mod device;
pub mod process;
pub mod provider;
pub mod router;
pub mod shutdown;
pub mod signals;
pub mod status;
pub mod supervisor;
pub mod tracker;
