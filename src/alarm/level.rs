//! Alarm severities and signal visibility tiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TyphosError;

/// Alarm state of a single channel or of a whole aggregation.
///
/// `NoAlarm < Minor < Major < Invalid` is the severity ordering used by the
/// summary. `Disconnected` sorts last but is never produced by `max`: the
/// aggregator checks connection state first and only then takes the maximum
/// severity of connected channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    /// Channel is in range.
    NoAlarm,
    /// Minor alarm.
    Minor,
    /// Major alarm.
    Major,
    /// Value cannot be trusted.
    Invalid,
    /// At least one channel is not connected.
    Disconnected,
}

impl AlarmLevel {
    /// Map a raw transport severity (`0..=3`) onto the enum.
    ///
    /// Anything else is a transport fault and yields `Err`; callers clamp it
    /// to [`AlarmLevel::Invalid`].
    pub fn from_raw(raw: i64) -> Result<Self, TyphosError> {
        match raw {
            0 => Ok(AlarmLevel::NoAlarm),
            1 => Ok(AlarmLevel::Minor),
            2 => Ok(AlarmLevel::Major),
            3 => Ok(AlarmLevel::Invalid),
            other => Err(TyphosError::InvalidSeverity(other)),
        }
    }

    /// Raw numeric value, `Disconnected` is 4.
    pub fn as_raw(self) -> i64 {
        match self {
            AlarmLevel::NoAlarm => 0,
            AlarmLevel::Minor => 1,
            AlarmLevel::Major => 2,
            AlarmLevel::Invalid => 3,
            AlarmLevel::Disconnected => 4,
        }
    }
}

impl fmt::Display for AlarmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmLevel::NoAlarm => "NO_ALARM",
            AlarmLevel::Minor => "MINOR",
            AlarmLevel::Major => "MAJOR",
            AlarmLevel::Invalid => "INVALID",
            AlarmLevel::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Visibility classification of a single signal inside a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Primary readback, shown everywhere.
    Hinted,
    /// Regular readback.
    #[default]
    Normal,
    /// Configuration value.
    Config,
    /// Internal signal, hidden by default.
    Omitted,
}

/// How much of a device tree takes part in the alarm summary.
///
/// Tiers are strictly nested: every signal included at one tier is also
/// included at every higher tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum KindLevel {
    /// Only hinted signals.
    #[default]
    Hinted,
    /// Hinted and normal signals.
    Normal,
    /// Everything except omitted signals.
    Config,
    /// Every signal.
    Omitted,
}

impl KindLevel {
    /// All tiers in ascending order.
    pub const ALL: [KindLevel; 4] = [
        KindLevel::Hinted,
        KindLevel::Normal,
        KindLevel::Config,
        KindLevel::Omitted,
    ];

    /// Whether a signal of `kind` is in scope at this tier.
    pub fn includes(self, kind: Kind) -> bool {
        match self {
            KindLevel::Hinted => kind == Kind::Hinted,
            KindLevel::Normal => matches!(kind, Kind::Hinted | Kind::Normal),
            KindLevel::Config => kind != Kind::Omitted,
            KindLevel::Omitted => true,
        }
    }
}

impl TryFrom<u8> for KindLevel {
    type Error = TyphosError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        KindLevel::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| TyphosError::InvalidKindLevel(value.to_string()))
    }
}

impl FromStr for KindLevel {
    type Err = TyphosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hinted" => Ok(KindLevel::Hinted),
            "normal" => Ok(KindLevel::Normal),
            "config" => Ok(KindLevel::Config),
            "omitted" => Ok(KindLevel::Omitted),
            _ => Err(TyphosError::InvalidKindLevel(s.to_string())),
        }
    }
}

impl fmt::Display for KindLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KindLevel::Hinted => "hinted",
            KindLevel::Normal => "normal",
            KindLevel::Config => "config",
            KindLevel::Omitted => "omitted",
        };
        f.write_str(name)
    }
}
