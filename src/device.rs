//! Device Trees
//!
//! The alarm core only needs a narrow view of a device: a stable name and a
//! list of components, each of which is either a leaf signal or a nested
//! sub-device. Control-system libraries plug in by implementing [`Device`].
//!
//! [`StaticDevice`] is a plain data implementation deserialized from the
//! `[[devices]]` catalog in the configuration file. It also carries the
//! simulated initial channel state used by the mock transport.
//!
//! # Example
//!
//! ```rust,ignore
//! let motor = StaticDevice::new("motor1")
//!     .with_signal(SignalSpec::new("user_readback", Kind::Hinted).with_address("ca://MTR:RBV"))
//!     .with_signal(SignalSpec::new("velocity", Kind::Config).with_address("ca://MTR:VELO"));
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::alarm::level::Kind;
use crate::alarm::scope::channel_address;

/// A leaf signal as seen by the scope resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    /// Attribute name within the parent device.
    pub name: String,
    /// Transport address; `None` for soft signals.
    pub address: Option<String>,
    /// Visibility classification.
    pub kind: Kind,
}

/// One entry of a device's component list.
#[derive(Clone)]
pub enum Component {
    /// A leaf signal.
    Signal(SignalInfo),
    /// A nested device, walked recursively.
    Device(Arc<dyn Device>),
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Signal(info) => f.debug_tuple("Signal").field(info).finish(),
            Component::Device(device) => f.debug_tuple("Device").field(&device.name()).finish(),
        }
    }
}

/// A hierarchical hardware device.
///
/// # Contract
/// - `name` is stable for the lifetime of the object and identifies the
///   device inside an aggregator
/// - `components` may fail for malformed or partially loaded devices; the
///   error is reported to whoever attached the device
pub trait Device: Send + Sync {
    /// Stable device identity.
    fn name(&self) -> &str;

    /// Direct children of this device.
    fn components(&self) -> Result<Vec<Component>>;
}

/// Signal entry of a [`StaticDevice`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    /// Signal attribute name
    pub name: String,
    /// Transport address (omit for soft signals)
    #[serde(default)]
    pub address: Option<String>,
    /// Visibility classification
    #[serde(default)]
    pub kind: Kind,
    /// Simulated connection state for the mock transport
    #[serde(default = "default_connected")]
    pub connected: bool,
    /// Simulated raw severity for the mock transport
    #[serde(default)]
    pub severity: i64,
}

fn default_connected() -> bool {
    true
}

impl SignalSpec {
    /// Connected, in-range signal without a transport address.
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            address: None,
            kind,
            connected: true,
            severity: 0,
        }
    }

    /// Set the transport address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the simulated raw severity.
    pub fn with_severity(mut self, severity: i64) -> Self {
        self.severity = severity;
        self
    }

    /// Mark the simulated channel as never connecting.
    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }
}

/// A device described entirely by data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDevice {
    /// Device name
    pub name: String,
    /// Leaf signals
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
    /// Nested sub-devices
    #[serde(default)]
    pub components: Vec<StaticDevice>,
}

impl StaticDevice {
    /// Empty device.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signals: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Add a leaf signal.
    pub fn with_signal(mut self, signal: SignalSpec) -> Self {
        self.signals.push(signal);
        self
    }

    /// Add a nested sub-device.
    pub fn with_component(mut self, component: StaticDevice) -> Self {
        self.components.push(component);
        self
    }

    /// Every signal spec of this device and its sub-devices, depth first,
    /// paired with the channel address the alarm core subscribes to.
    pub fn channel_specs(&self) -> Vec<(String, &SignalSpec)> {
        let mut specs = Vec::new();
        let mut path = Vec::new();
        self.collect_specs(&mut path, &mut specs);
        specs
    }

    fn collect_specs<'a>(
        &'a self,
        path: &mut Vec<&'a str>,
        specs: &mut Vec<(String, &'a SignalSpec)>,
    ) {
        path.push(&self.name);
        for spec in &self.signals {
            specs.push((channel_address(path.as_slice(), &Self::signal_info(spec)), spec));
        }
        for component in &self.components {
            component.collect_specs(path, specs);
        }
        path.pop();
    }

    fn signal_info(spec: &SignalSpec) -> SignalInfo {
        SignalInfo {
            name: spec.name.clone(),
            address: spec.address.clone(),
            kind: spec.kind,
        }
    }
}

impl Device for StaticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn components(&self) -> Result<Vec<Component>> {
        let mut out: Vec<Component> = self
            .signals
            .iter()
            .map(|spec| Component::Signal(Self::signal_info(spec)))
            .collect();
        out.extend(
            self.components
                .iter()
                .map(|sub| Component::Device(Arc::new(sub.clone()) as Arc<dyn Device>)),
        );
        Ok(out)
    }
}
