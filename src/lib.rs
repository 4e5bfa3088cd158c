//! # Typhos Alarm Core
//!
//! This crate summarizes the alarm state of hierarchical instrument devices.
//! A device is walked down to its leaf signals, the signals in scope at the
//! configured kind level are subscribed to over a live-data transport, and
//! their connection and severity updates are reduced into a single alarm
//! level that drives a coloured indicator.
//!
//! ## Crate Structure
//!
//! - **`alarm`**: the aggregation engine: severities and tiers, scope
//!   resolution, channel subscriptions, the `AlarmAggregator` state machine,
//!   the `AlarmService` task and the `AlarmIndicator` widget.
//! - **`device`**: the `Device` trait the engine consumes, plus
//!   `StaticDevice`, a data-only device used by the configuration catalog.
//! - **`mock`**: an in-memory transport for tests and the demo binary.
//! - **`config`**: figment-based configuration (TOML + `TYPHOS_` env vars).
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`error`**: the `TyphosError` enum shared by all modules.

pub mod alarm;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod mock;
