//! Alarm service task.
//!
//! Runs an [`AlarmAggregator`] on its own tokio task and makes that task the
//! aggregator's owner context. Callers talk to it through a cloneable
//! [`AlarmHandle`]; each request is a message with a oneshot reply, and the
//! task interleaves those requests with transport events using
//! `tokio::select!`. Requests are served in order, so an `attach` followed by
//! `set_kind_level` from the same handle never overlap.

use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::alarm::aggregator::{AlarmAggregator, AlarmChange};
use crate::alarm::level::{AlarmLevel, KindLevel};
use crate::device::Device;
use crate::error::{AppResult, TyphosError};

/// Request queue depth.
const COMMAND_CAPACITY: usize = 32;

enum AlarmCommand {
    Attach {
        device: Arc<dyn Device>,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Detach {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    SetKindLevel {
        kind_level: KindLevel,
        reply: oneshot::Sender<()>,
    },
    Summary {
        reply: oneshot::Sender<AlarmLevel>,
    },
    Channels {
        reply: oneshot::Sender<Vec<String>>,
    },
    DeviceChannels {
        name: String,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
    SubscribeChanges {
        reply: oneshot::Sender<broadcast::Receiver<AlarmChange>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client side of a running alarm service.
#[derive(Clone)]
pub struct AlarmHandle {
    commands: mpsc::Sender<AlarmCommand>,
    summary: watch::Receiver<AlarmLevel>,
}

impl std::fmt::Debug for AlarmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmHandle")
            .field("summary", &*self.summary.borrow())
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

/// Move `aggregator` onto a new task and return a handle to it.
pub fn spawn(aggregator: AlarmAggregator) -> (AlarmHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
    let handle = AlarmHandle {
        commands,
        summary: aggregator.watch(),
    };
    let task = tokio::spawn(run(aggregator, rx));
    (handle, task)
}

async fn run(mut aggregator: AlarmAggregator, mut commands: mpsc::Receiver<AlarmCommand>) {
    info!(kind_level = %aggregator.kind_level(), "alarm service started");
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => {
                    if dispatch(&mut aggregator, command).is_break() {
                        break;
                    }
                }
                None => {
                    aggregator.clear();
                    break;
                }
            },
            Some(event) = aggregator.next_event() => {
                aggregator.handle_event(event);
            }
        }
    }
    info!("alarm service stopped");
}

fn dispatch(aggregator: &mut AlarmAggregator, command: AlarmCommand) -> ControlFlow<()> {
    // A dropped reply receiver just means the caller stopped waiting.
    match command {
        AlarmCommand::Attach { device, reply } => {
            let _ = reply.send(aggregator.attach(device));
        }
        AlarmCommand::Detach { name, reply } => {
            let _ = reply.send(aggregator.detach(&name));
        }
        AlarmCommand::SetKindLevel { kind_level, reply } => {
            aggregator.set_kind_level(kind_level);
            let _ = reply.send(());
        }
        AlarmCommand::Summary { reply } => {
            aggregator.process_pending();
            let _ = reply.send(aggregator.summary());
        }
        AlarmCommand::Channels { reply } => {
            let channels = aggregator.channels().into_iter().map(String::from).collect();
            let _ = reply.send(channels);
        }
        AlarmCommand::SubscribeChanges { reply } => {
            let _ = reply.send(aggregator.subscribe_changes());
        }
        AlarmCommand::DeviceChannels { name, reply } => {
            let channels = aggregator
                .device_channels(&name)
                .map(|channels| channels.into_iter().map(String::from).collect());
            let _ = reply.send(channels);
        }
        AlarmCommand::Shutdown { reply } => {
            debug!("alarm service shutting down");
            aggregator.clear();
            let _ = reply.send(());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

impl AlarmHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> AlarmCommand,
    ) -> AppResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| TyphosError::ServiceStopped)?;
        rx.await.map_err(|_| TyphosError::ServiceStopped)
    }

    /// Attach a device. Resolution errors come back to the caller.
    pub async fn attach(&self, device: Arc<dyn Device>) -> AppResult<()> {
        self.request(|reply| AlarmCommand::Attach { device, reply })
            .await?
    }

    /// Detach a device by name. `Ok(false)` if it was not attached.
    pub async fn detach(&self, name: impl Into<String>) -> AppResult<bool> {
        let name = name.into();
        self.request(|reply| AlarmCommand::Detach { name, reply }).await
    }

    /// Change the tier and rescope every attached device.
    pub async fn set_kind_level(&self, kind_level: KindLevel) -> AppResult<()> {
        self.request(|reply| AlarmCommand::SetKindLevel { kind_level, reply })
            .await
    }

    /// Summary after applying every event queued so far.
    pub async fn summary(&self) -> AppResult<AlarmLevel> {
        self.request(|reply| AlarmCommand::Summary { reply }).await
    }

    /// Tracked addresses, sorted.
    pub async fn channels(&self) -> AppResult<Vec<String>> {
        self.request(|reply| AlarmCommand::Channels { reply }).await
    }

    /// Addresses contributed by one device, `None` if it is not attached.
    pub async fn device_channels(&self, name: impl Into<String>) -> AppResult<Option<Vec<String>>> {
        let name = name.into();
        self.request(|reply| AlarmCommand::DeviceChannels { name, reply })
            .await
    }

    /// Receiver of every future summary change.
    pub async fn subscribe_changes(&self) -> AppResult<broadcast::Receiver<AlarmChange>> {
        self.request(|reply| AlarmCommand::SubscribeChanges { reply })
            .await
    }

    /// Receiver that always holds the latest summary.
    pub fn watch(&self) -> watch::Receiver<AlarmLevel> {
        self.summary.clone()
    }

    /// Close every channel and stop the task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(|reply| AlarmCommand::Shutdown { reply }).await
    }
}
