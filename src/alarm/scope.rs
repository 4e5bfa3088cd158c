//! Signal scope resolution.
//!
//! Turns a device tree and a [`KindLevel`] into the set of transport
//! addresses that take part in the alarm summary. The result is a
//! `BTreeSet`, so the same tree and tier always produce the same ordered
//! set, and because tier inclusion is nested the sets grow monotonically
//! with the tier.

use std::collections::BTreeSet;

use crate::alarm::level::KindLevel;
use crate::device::{Component, Device, SignalInfo};
use crate::error::{AppResult, TyphosError};

/// Nesting limit for sub-devices. Also what stops a device that lists
/// itself as a component.
pub const MAX_DEPTH: usize = 32;

/// Prefix used for signals that have no transport address of their own.
pub const SOFT_SIGNAL_SCHEME: &str = "sig://";

/// Separator between path segments of a soft address.
const PATH_SEPARATOR: char = '.';

/// A leaf signal in scope, with the device path that leads to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedSignal {
    /// Names of the devices from the top-level device down to the parent
    pub path: Vec<String>,
    /// The signal itself
    pub signal: SignalInfo,
}

impl ScopedSignal {
    /// Address the alarm core subscribes to for this signal.
    pub fn address(&self) -> String {
        channel_address(self.path.as_slice(), &self.signal)
    }
}

/// Address for `signal` reached through the devices in `path`.
///
/// Soft signals get `sig://` followed by the device path and the signal
/// name, each segment escaped so that distinct leaves never share an
/// address.
pub fn channel_address<S: AsRef<str>>(path: &[S], signal: &SignalInfo) -> String {
    if let Some(address) = &signal.address {
        return address.clone();
    }
    let mut out = String::from(SOFT_SIGNAL_SCHEME);
    for segment in path.iter().map(AsRef::as_ref).chain(std::iter::once(signal.name.as_str())) {
        if out.len() > SOFT_SIGNAL_SCHEME.len() {
            out.push(PATH_SEPARATOR);
        }
        escape_segment(segment, &mut out);
    }
    out
}

fn escape_segment(segment: &str, out: &mut String) {
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            PATH_SEPARATOR => out.push_str("%2E"),
            c => out.push(c),
        }
    }
}

/// Every leaf signal of `device` in scope at `level`, depth first.
pub fn signals_in_scope(device: &dyn Device, level: KindLevel) -> AppResult<Vec<ScopedSignal>> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    walk(device, device.name(), level, &mut path, &mut out)?;
    Ok(out)
}

/// Addresses of every signal of `device` in scope at `level`.
pub fn resolve(device: &dyn Device, level: KindLevel) -> AppResult<BTreeSet<String>> {
    Ok(signals_in_scope(device, level)?
        .iter()
        .map(ScopedSignal::address)
        .collect())
}

fn walk(
    device: &dyn Device,
    root: &str,
    level: KindLevel,
    path: &mut Vec<String>,
    out: &mut Vec<ScopedSignal>,
) -> AppResult<()> {
    let name = device.name().to_string();
    if path.len() >= MAX_DEPTH {
        return Err(TyphosError::Resolution {
            device: root.to_string(),
            reason: format!(
                "sub-devices nested deeper than {} (last '{}'), possibly a cycle",
                MAX_DEPTH, name
            ),
        });
    }

    let components = device
        .components()
        .map_err(|e| TyphosError::Resolution {
            device: root.to_string(),
            reason: format!("{}: {:#}", name, e),
        })?;

    path.push(name);
    for component in components {
        match component {
            Component::Signal(signal) => {
                if level.includes(signal.kind) {
                    out.push(ScopedSignal {
                        path: path.clone(),
                        signal,
                    });
                }
            }
            Component::Device(sub) => walk(sub.as_ref(), root, level, path, out)?,
        }
    }
    path.pop();
    Ok(())
}
