//! Live channel subscriptions.
//!
//! A [`ChannelTransport`] is the boundary to the control-system network. It
//! is handed a [`ChannelListener`] for each address and reports connection and
//! severity changes to it from whatever thread its I/O runs on. The listener
//! does not touch aggregator state: it only enqueues a [`ChannelEvent`] on
//! the aggregator's event queue, which is drained on the aggregator's owner
//! context.
//!
//! # Close semantics
//!
//! [`ChannelSubscription::close`] shuts the listener's gate under a lock, so
//! once it returns no further event for that subscription can be enqueued.
//! Events enqueued before the close are still in the queue; they carry the
//! subscription's [`SubscriptionId`] and the aggregator discards any event
//! whose id no longer matches an open subscription.

use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{AppResult, TyphosError};

/// Identity of one open/close cycle of a subscription.
pub type SubscriptionId = u64;

/// Sending half of an aggregator event queue.
pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Receiving half of an aggregator event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// A state change reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelUpdate {
    /// Channel connected (`true`) or lost its connection (`false`).
    Connection(bool),
    /// Raw alarm severity as reported on the wire.
    Severity(i64),
}

/// A transport callback, marshalled onto the aggregator's queue.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    /// Subscription that produced the event
    pub id: SubscriptionId,
    /// Address of the channel
    pub address: Arc<str>,
    /// What changed
    pub update: ChannelUpdate,
}

type Gate = Arc<Mutex<Option<EventSender>>>;

fn lock_gate(gate: &Mutex<Option<EventSender>>) -> MutexGuard<'_, Option<EventSender>> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Callback sink given to a transport for one address.
///
/// Cheap to clone and safe to call from any thread.
#[derive(Clone)]
pub struct ChannelListener {
    id: SubscriptionId,
    address: Arc<str>,
    gate: Gate,
}

impl std::fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelListener")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelListener {
    /// Address this listener was opened for.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Subscription id of this listener.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Report a connection change.
    pub fn connection_changed(&self, connected: bool) {
        self.send(ChannelUpdate::Connection(connected));
    }

    /// Report a raw severity change.
    pub fn severity_changed(&self, severity: i64) {
        self.send(ChannelUpdate::Severity(severity));
    }

    /// Whether the owning subscription has been closed.
    pub fn is_closed(&self) -> bool {
        lock_gate(&self.gate).is_none()
    }

    fn send(&self, update: ChannelUpdate) {
        let gate = lock_gate(&self.gate);
        match gate.as_ref() {
            Some(tx) => {
                let event = ChannelEvent {
                    id: self.id,
                    address: self.address.clone(),
                    update,
                };
                // The receiver only goes away when the aggregator is dropped.
                if tx.send(event).is_err() {
                    trace!(address = %self.address, "event queue closed, dropping update");
                }
            }
            None => trace!(address = %self.address, ?update, "update after close ignored"),
        }
    }
}

/// Transport-side resources of one open address.
pub trait TransportHandle: Send {
    /// Stop delivering callbacks for this address.
    fn close(&mut self);
}

/// Capability: live data transport
///
/// # Contract
/// - `open` must not block on network I/O; connection and severity are
///   reported later through the listener
/// - callbacks may arrive on any thread, in any order
/// - an `Err` from `open` means the address will never deliver data
pub trait ChannelTransport: Send + Sync {
    /// Start monitoring `listener.address()`.
    fn open(&self, listener: ChannelListener) -> Result<Box<dyn TransportHandle>>;
}

/// One open subscription to a named channel.
pub struct ChannelSubscription {
    id: SubscriptionId,
    address: Arc<str>,
    gate: Gate,
    handle: Option<Box<dyn TransportHandle>>,
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

impl ChannelSubscription {
    /// Open `address` on `transport`, delivering events to `events`.
    ///
    /// On `Err` nothing is left registered with the transport and no event
    /// for `id` will ever be enqueued.
    pub fn open(
        transport: &dyn ChannelTransport,
        address: &str,
        id: SubscriptionId,
        events: &EventSender,
    ) -> AppResult<Self> {
        let address: Arc<str> = Arc::from(address);
        let gate: Gate = Arc::new(Mutex::new(Some(events.clone())));
        let listener = ChannelListener {
            id,
            address: address.clone(),
            gate: gate.clone(),
        };

        match transport.open(listener) {
            Ok(handle) => {
                debug!(%address, id, "opened channel");
                Ok(Self {
                    id,
                    address,
                    gate,
                    handle: Some(handle),
                })
            }
            Err(e) => {
                lock_gate(&gate).take();
                Err(TyphosError::SubscriptionOpen {
                    address: address.to_string(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether `close` has not run yet.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Unsubscribe. No event is enqueued for this subscription after return.
    pub fn close(&mut self) {
        lock_gate(&self.gate).take();
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            debug!(address = %self.address, id = self.id, "closed channel");
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
