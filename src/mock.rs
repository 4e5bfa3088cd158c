//! Mock Channel Transport
//!
//! Provides an in-memory [`ChannelTransport`] for testing without a control
//! system network. Channel state is scripted by the caller:
//!
//! - `set_connected` / `set_severity` push updates to every listener open on
//!   the address, from whatever thread the caller is on
//! - addresses marked with `reject` fail to open
//! - open/close counters per address make reference counting observable
//!
//! A newly opened listener immediately receives the current state of an
//! address that is connected. Addresses that were never scripted behave like
//! a channel whose server never answers: no callback is delivered.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

use crate::alarm::channel::{ChannelListener, ChannelTransport, TransportHandle};
use crate::device::StaticDevice;

#[derive(Debug, Clone, Copy, Default)]
struct MockChannel {
    connected: bool,
    severity: i64,
}

#[derive(Default)]
struct MockState {
    channels: HashMap<String, MockChannel>,
    listeners: HashMap<String, Vec<(u64, ChannelListener)>>,
    rejected: HashSet<String>,
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    next_token: u64,
}

/// In-memory transport with scripted channel state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockTransport")
            .field("channels", &state.channels.len())
            .field("open_addresses", &state.listeners.len())
            .finish()
    }
}

impl MockTransport {
    /// Transport with no scripted channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport seeded with the simulated state of every signal in `devices`.
    pub fn from_devices<'a>(devices: impl IntoIterator<Item = &'a StaticDevice>) -> Self {
        let transport = Self::new();
        {
            let mut state = transport.lock();
            for device in devices {
                for (address, spec) in device.channel_specs() {
                    state.channels.insert(
                        address,
                        MockChannel {
                            connected: spec.connected,
                            severity: spec.severity,
                        },
                    );
                }
            }
        }
        transport
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listeners_of(state: &MockState, address: &str) -> Vec<ChannelListener> {
        state
            .listeners
            .get(address)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// Make every future `open` of `address` fail.
    pub fn reject(&self, address: impl Into<String>) {
        self.lock().rejected.insert(address.into());
    }

    /// Change the connection state of `address` and notify open listeners.
    pub fn set_connected(&self, address: &str, connected: bool) {
        let listeners = {
            let mut state = self.lock();
            state.channels.entry(address.to_string()).or_default().connected = connected;
            Self::listeners_of(&state, address)
        };
        for listener in listeners {
            listener.connection_changed(connected);
        }
    }

    /// Change the raw severity of `address` and notify open listeners.
    ///
    /// Values outside `0..=3` are passed through untouched.
    pub fn set_severity(&self, address: &str, severity: i64) {
        let listeners = {
            let mut state = self.lock();
            state.channels.entry(address.to_string()).or_default().severity = severity;
            Self::listeners_of(&state, address)
        };
        for listener in listeners {
            listener.severity_changed(severity);
        }
    }

    /// Connect `address` with `severity` in one step.
    pub fn connect_with(&self, address: &str, severity: i64) {
        self.set_severity(address, severity);
        self.set_connected(address, true);
    }

    /// Number of successful opens of `address` so far.
    pub fn open_count(&self, address: &str) -> usize {
        self.lock().opens.get(address).copied().unwrap_or(0)
    }

    /// Number of closes of `address` so far.
    pub fn close_count(&self, address: &str) -> usize {
        self.lock().closes.get(address).copied().unwrap_or(0)
    }

    /// Number of listeners currently open on `address`.
    pub fn active_count(&self, address: &str) -> usize {
        self.lock().listeners.get(address).map_or(0, Vec::len)
    }

    /// Addresses with at least one open listener, sorted.
    pub fn open_addresses(&self) -> Vec<String> {
        let state = self.lock();
        let mut out: Vec<String> = state
            .listeners
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(address, _)| address.clone())
            .collect();
        out.sort();
        out
    }
}

struct MockHandle {
    state: Arc<Mutex<MockState>>,
    address: String,
    token: u64,
}

impl TransportHandle for MockHandle {
    fn close(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entries) = state.listeners.get_mut(&self.address) {
            entries.retain(|(token, _)| *token != self.token);
            if entries.is_empty() {
                state.listeners.remove(&self.address);
            }
        }
        *state.closes.entry(self.address.clone()).or_default() += 1;
        trace!(address = %self.address, "mock channel closed");
    }
}

impl ChannelTransport for MockTransport {
    fn open(&self, listener: ChannelListener) -> Result<Box<dyn TransportHandle>> {
        let address = listener.address().to_string();
        let (token, current) = {
            let mut state = self.lock();
            if state.rejected.contains(&address) {
                return Err(anyhow!("mock transport rejects '{}'", address));
            }
            let token = state.next_token;
            state.next_token += 1;
            *state.opens.entry(address.clone()).or_default() += 1;
            state
                .listeners
                .entry(address.clone())
                .or_default()
                .push((token, listener.clone()));
            (token, state.channels.get(&address).copied())
        };

        if let Some(channel) = current.filter(|c| c.connected) {
            listener.severity_changed(channel.severity);
            listener.connection_changed(true);
        }

        Ok(Box::new(MockHandle {
            state: self.state.clone(),
            address,
            token,
        }))
    }
}
