//! Custom error types for the alarm core.
//!
//! This module defines `TyphosError`, the error type shared by every layer of
//! the crate. Using the `thiserror` crate, it keeps the taxonomy of alarm
//! faults in one place:
//!
//! - **`Resolution`**: a device tree could not be enumerated (a component
//!   lookup failed, or sub-devices nest too deep, which is how a cycle shows
//!   up). Surfaced once, to the caller of `attach`.
//! - **`SubscriptionOpen`**: the transport refused an address. The aggregator
//!   absorbs it and tracks the address as permanently disconnected.
//! - **`InvalidSeverity`**: a transport reported a raw severity outside the
//!   alarm enum. Clamped to `Invalid` and reported, never propagated.
//! - **`InvalidKindLevel`**: a raw tier value (number or string) that does not
//!   name a `KindLevel`. Fails at the conversion site.
//! - **`Configuration`** / **`Config`**: semantic and parse errors from the
//!   configuration layer.
//! - **`ServiceStopped`**: the alarm service task is gone.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TyphosError>;

#[derive(Error, Debug)]
pub enum TyphosError {
    #[error("Unable to resolve signals of device '{device}': {reason}")]
    Resolution { device: String, reason: String },

    #[error("Transport rejected address '{address}': {reason}")]
    SubscriptionOpen { address: String, reason: String },

    #[error("Received invalid alarm severity {0}")]
    InvalidSeverity(i64),

    #[error("Invalid kind level '{0}'. Must be one of: hinted, normal, config, omitted")]
    InvalidKindLevel(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Alarm service is no longer running")]
    ServiceStopped,
}

impl From<figment::Error> for TyphosError {
    fn from(value: figment::Error) -> Self {
        TyphosError::Config(Box::new(value))
    }
}

impl TyphosError {
    /// Whether this error only affects a single address or device and the
    /// rest of the aggregation can carry on.
    pub fn is_isolated(&self) -> bool {
        matches!(
            self,
            TyphosError::Resolution { .. }
                | TyphosError::SubscriptionOpen { .. }
                | TyphosError::InvalidSeverity(_)
        )
    }
}
