//! # ipu-daemon: IPU slot manager daemon
//!
//! Hosts one [`ipu_core::IpuDevice`] over a simulated pipeline and exposes
//! its control surface to remote consumers over TCP.
//!
//! ## Startup
//!
//! - Loads `DaemonConfig` from TOML (defaults when absent).
//! - Installs and starts the `[pipeline]` configuration when `autostart`
//!   is set; otherwise waits for a client to call `init`.
//! - Generates frames at `simulation.fps` while the pipeline runs.

pub mod config;
pub mod service;
