//! Alarm summary framework.
//!
//! - `level`: alarm severities, signal kinds and kind-level tiers
//! - `scope`: which addresses of a device tree are in scope at a tier
//! - `channel`: transport boundary and per-address subscriptions
//! - `aggregator`: the state machine reducing channels to one summary
//! - `service`: the aggregator on its own tokio task
//! - `indicator`: coloured shape following a summary

pub mod aggregator;
pub mod channel;
pub mod indicator;
pub mod level;
pub mod scope;
pub mod service;

pub use aggregator::{AlarmAggregator, AlarmChange, ChannelState};
pub use channel::{ChannelListener, ChannelSubscription, ChannelTransport, TransportHandle};
pub use indicator::{create_alarm_indicator, AlarmColor, AlarmIndicator, IndicatorShape, ShapeKind};
pub use level::{AlarmLevel, Kind, KindLevel};
pub use service::AlarmHandle;
