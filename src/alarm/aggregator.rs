//! Alarm aggregation state machine.
//!
//! `AlarmAggregator` owns one [`ChannelSubscription`] per address in scope,
//! the [`ChannelState`] of each, and the aggregate summary. Every public
//! mutation takes `&mut self`, so the owner of the value is the single
//! context on which attach/detach/rescope and recompute run. Transport
//! callbacks never touch this struct directly: they land on the event queue
//! and are applied by [`AlarmAggregator::process_pending`] (or by the
//! `AlarmService` task, which awaits [`AlarmAggregator::next_event`]).
//!
//! # Summary rule
//!
//! - any tracked channel not connected: `Disconnected`
//! - nothing tracked: `NoAlarm`
//! - otherwise: the maximum severity over all tracked channels
//!
//! Notifications go out on a `watch` channel (latest value, used by
//! indicators) and a `broadcast` channel of [`AlarmChange`]s (every change,
//! used by loggers). Both fire only when the summary value actually changes.
//!
//! # Reference counting
//!
//! Two devices may resolve to the same address. The channel is opened once
//! and carries an owner count; it is closed when the last owning device is
//! detached or rescoped away from it.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::alarm::channel::{
    ChannelEvent, ChannelSubscription, ChannelTransport, ChannelUpdate, EventReceiver,
    EventSender, SubscriptionId,
};
use crate::alarm::level::{AlarmLevel, KindLevel};
use crate::alarm::scope;
use crate::device::Device;
use crate::error::AppResult;

/// Capacity of the change broadcast; slow receivers see `Lagged`.
const CHANGE_CAPACITY: usize = 64;

/// Connection and severity of one tracked address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    /// Whether the transport reports the channel connected
    pub connected: bool,
    /// Last reported severity, ignored while disconnected
    pub severity: AlarmLevel,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            connected: false,
            severity: AlarmLevel::Invalid,
        }
    }
}

/// A summary transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmChange {
    /// Summary before the change
    pub previous: AlarmLevel,
    /// Summary after the change
    pub current: AlarmLevel,
    /// When the aggregator recomputed
    pub timestamp: DateTime<Utc>,
}

struct TrackedChannel {
    id: SubscriptionId,
    /// `None` when the transport refused the address.
    subscription: Option<ChannelSubscription>,
    state: ChannelState,
    owners: usize,
}

struct ManagedDevice {
    device: Arc<dyn Device>,
    addresses: BTreeSet<String>,
}

/// Reduces many live channels to one alarm level.
pub struct AlarmAggregator {
    transport: Arc<dyn ChannelTransport>,
    kind_level: KindLevel,
    devices: BTreeMap<String, ManagedDevice>,
    channels: BTreeMap<String, TrackedChannel>,
    next_id: SubscriptionId,
    events_tx: EventSender,
    events_rx: EventReceiver,
    summary: AlarmLevel,
    summary_tx: watch::Sender<AlarmLevel>,
    changes_tx: broadcast::Sender<AlarmChange>,
    invalid_severity_reports: u64,
}

impl std::fmt::Debug for AlarmAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmAggregator")
            .field("kind_level", &self.kind_level)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("channels", &self.channels.len())
            .field("summary", &self.summary)
            .finish()
    }
}

impl AlarmAggregator {
    /// Empty aggregator at the default tier (`Hinted`).
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self::with_kind_level(transport, KindLevel::default())
    }

    /// Empty aggregator at `kind_level`.
    pub fn with_kind_level(transport: Arc<dyn ChannelTransport>, kind_level: KindLevel) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (summary_tx, _) = watch::channel(AlarmLevel::NoAlarm);
        let (changes_tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            transport,
            kind_level,
            devices: BTreeMap::new(),
            channels: BTreeMap::new(),
            next_id: 0,
            events_tx,
            events_rx,
            summary: AlarmLevel::NoAlarm,
            summary_tx,
            changes_tx,
            invalid_severity_reports: 0,
        }
    }

    /// Current aggregate summary.
    pub fn summary(&self) -> AlarmLevel {
        self.summary
    }

    /// Current tier.
    pub fn kind_level(&self) -> KindLevel {
        self.kind_level
    }

    /// Receiver that always holds the latest summary.
    pub fn watch(&self) -> watch::Receiver<AlarmLevel> {
        self.summary_tx.subscribe()
    }

    /// Receiver of every future summary change.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<AlarmChange> {
        self.changes_tx.subscribe()
    }

    /// Names of attached devices, sorted.
    pub fn devices(&self) -> Vec<&str> {
        self.devices.keys().map(String::as_str).collect()
    }

    /// Whether a device with `name` is attached.
    pub fn is_attached(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Tracked addresses, sorted.
    pub fn channels(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    /// Addresses contributed by one attached device.
    pub fn device_channels(&self, name: &str) -> Option<Vec<&str>> {
        self.devices
            .get(name)
            .map(|managed| managed.addresses.iter().map(String::as_str).collect())
    }

    /// State of a tracked address.
    pub fn channel_state(&self, address: &str) -> Option<ChannelState> {
        self.channels.get(address).map(|channel| channel.state)
    }

    /// Number of attached devices that include `address`.
    pub fn owner_count(&self, address: &str) -> usize {
        self.channels.get(address).map_or(0, |channel| channel.owners)
    }

    /// How many out-of-range severities have been clamped to `Invalid`.
    pub fn invalid_severity_reports(&self) -> u64 {
        self.invalid_severity_reports
    }

    /// Start aggregating `device` at the current tier.
    ///
    /// A device whose name is already attached is left as it is. Resolution
    /// errors are returned and leave the aggregator unchanged. Addresses the
    /// transport refuses are tracked as permanently disconnected.
    pub fn attach(&mut self, device: Arc<dyn Device>) -> AppResult<()> {
        let name = device.name().to_string();
        if self.is_attached(&name) {
            debug!(device = %name, "device already attached");
            return Ok(());
        }

        let addresses = scope::resolve(device.as_ref(), self.kind_level)?;
        info!(
            device = %name,
            channels = addresses.len(),
            kind_level = %self.kind_level,
            "attaching device to alarm summary"
        );
        for address in &addresses {
            self.acquire(address);
        }
        self.devices.insert(name, ManagedDevice { device, addresses });
        self.apply_queued();
        self.recompute();
        Ok(())
    }

    /// Stop aggregating the device called `name`.
    ///
    /// Returns `false` (and does nothing) if no such device is attached.
    pub fn detach(&mut self, name: &str) -> bool {
        let Some(managed) = self.devices.remove(name) else {
            debug!(device = %name, "detach of unknown device ignored");
            return false;
        };
        info!(device = %name, "detaching device from alarm summary");
        for address in &managed.addresses {
            self.release(address);
        }
        self.recompute();
        true
    }

    /// Detach every device and close every channel.
    pub fn clear(&mut self) {
        let devices = std::mem::take(&mut self.devices);
        for managed in devices.values() {
            for address in &managed.addresses {
                self.release(address);
            }
        }
        self.recompute();
    }

    /// Change the tier and rescope every attached device.
    ///
    /// Runs as one transition: channels in both the old and the new scope
    /// keep their subscription and state, channels only in the old scope are
    /// closed, new ones are opened, and the summary is recomputed once at the
    /// end, after folding in any state the transport delivered while opening.
    /// A device that fails to resolve at the new tier keeps its previous
    /// scope.
    pub fn set_kind_level(&mut self, kind_level: KindLevel) {
        if kind_level == self.kind_level {
            return;
        }
        info!(from = %self.kind_level, to = %kind_level, "changing alarm kind level");
        self.kind_level = kind_level;

        let mut rescoped = Vec::with_capacity(self.devices.len());
        for (name, managed) in &self.devices {
            match scope::resolve(managed.device.as_ref(), kind_level) {
                Ok(addresses) => rescoped.push((name.clone(), addresses)),
                Err(e) => error!(device = %name, error = %e, "keeping previous alarm scope"),
            }
        }

        for (name, addresses) in rescoped {
            // Acquire before release so shared addresses never drop to zero.
            for address in &addresses {
                self.acquire(address);
            }
            let previous = match self.devices.get_mut(&name) {
                Some(managed) => std::mem::replace(&mut managed.addresses, addresses),
                None => continue,
            };
            for address in &previous {
                self.release(address);
            }
        }
        self.apply_queued();
        self.recompute();
    }

    /// Apply one transport event. Returns `false` for stale events.
    pub fn handle_event(&mut self, event: ChannelEvent) -> bool {
        let applied = self.apply_event(event);
        if applied {
            self.recompute();
        }
        applied
    }

    fn apply_event(&mut self, event: ChannelEvent) -> bool {
        let current_id = self.channels.get(&*event.address).map(|channel| channel.id);
        if current_id != Some(event.id) {
            trace!(address = %event.address, id = event.id, "discarding stale channel event");
            return false;
        }

        let severity = match event.update {
            ChannelUpdate::Severity(raw) => Some(self.clamp_severity(&event.address, raw)),
            ChannelUpdate::Connection(_) => None,
        };
        if let Some(channel) = self.channels.get_mut(&*event.address) {
            match (event.update, severity) {
                (ChannelUpdate::Connection(connected), _) => channel.state.connected = connected,
                (ChannelUpdate::Severity(_), Some(level)) => channel.state.severity = level,
                (ChannelUpdate::Severity(_), None) => {}
            }
            trace!(address = %event.address, state = ?channel.state, "channel updated");
        }
        true
    }

    /// Fold events the transport delivered while opening channels into the
    /// operation's single recompute.
    fn apply_queued(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event);
        }
    }

    /// Apply every event already queued. Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            if self.handle_event(event) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait for the next queued transport event.
    ///
    /// Never returns `None` while the aggregator is alive, since it holds a
    /// sender of its own queue.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events_rx.recv().await
    }

    fn clamp_severity(&mut self, address: &str, raw: i64) -> AlarmLevel {
        match AlarmLevel::from_raw(raw) {
            Ok(level) => level,
            Err(e) => {
                self.invalid_severity_reports += 1;
                warn!(%address, error = %e, "clamping severity to INVALID");
                AlarmLevel::Invalid
            }
        }
    }

    fn acquire(&mut self, address: &str) {
        if let Some(channel) = self.channels.get_mut(address) {
            channel.owners += 1;
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        let subscription =
            match ChannelSubscription::open(self.transport.as_ref(), address, id, &self.events_tx) {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    warn!(%address, error = %e, "tracking address as disconnected");
                    None
                }
            };
        self.channels.insert(
            address.to_string(),
            TrackedChannel {
                id,
                subscription,
                state: ChannelState::default(),
                owners: 1,
            },
        );
    }

    fn release(&mut self, address: &str) {
        let Some(channel) = self.channels.get_mut(address) else {
            return;
        };
        channel.owners = channel.owners.saturating_sub(1);
        if channel.owners == 0 {
            if let Some(mut subscription) =
                self.channels.remove(address).and_then(|channel| channel.subscription)
            {
                subscription.close();
            }
        }
    }

    fn compute(&self) -> AlarmLevel {
        if self.channels.values().any(|channel| !channel.state.connected) {
            return AlarmLevel::Disconnected;
        }
        self.channels
            .values()
            .map(|channel| channel.state.severity)
            .max()
            .unwrap_or(AlarmLevel::NoAlarm)
    }

    fn recompute(&mut self) {
        let current = self.compute();
        let previous = self.summary;
        self.summary = current;
        if current == previous {
            return;
        }
        debug!(%previous, %current, "alarm summary changed");
        self.summary_tx.send_replace(current);
        // No receivers is fine.
        let _ = self.changes_tx.send(AlarmChange {
            previous,
            current,
            timestamp: Utc::now(),
        });
    }
}
