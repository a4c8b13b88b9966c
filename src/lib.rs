//! # rust-mediator
//!
//! An industrial-automation mediator: a single process hosting a
//! configurable set of modules (data-acquisition drivers, calculation
//! engines, alarm engines) behind a unified RPC/WebSocket API. Clients —
//! and modules themselves, over a loopback connection — read and write
//! variables, subscribe to change events and query the historian that
//! captures every variable value over time.
//!
//! ## Crate structure
//!
//! - **`values`**: the `VTQ`/`VTTQ` observation records, timestamps,
//!   quality and the reference types addressing objects and variables.
//! - **`config`**: TOML settings with validation.
//! - **`error`**: the `MediatorError` taxonomy mapped onto HTTP statuses.
//! - **`variables`**: per-module store of current values with crash-safe
//!   file persistence.
//! - **`modules`**: the `Module` trait, the inbox runner enforcing the
//!   single-threaded module contract, the factory registry and the
//!   built-in simulator.
//! - **`supervisor`**: lifecycle state machine, init ordering,
//!   restart-on-failure and the actor owning all shared state.
//! - **`history`**: per-database historian workers with a
//!   prioritise-and-compress work queue over SQLite channel stores.
//! - **`network`**: RPC protocol types, sessions with subscriptions and
//!   ack-gated event delivery, and the axum transport.

pub mod auth;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod modules;
pub mod network;
pub mod supervisor;
pub mod values;
pub mod variables;
