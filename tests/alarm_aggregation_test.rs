//! Integration tests for the alarm aggregator
//!
//! These tests drive an `AlarmAggregator` with the mock transport and check
//! the summary rules, reference counting of shared channels, rescoping and
//! the indicator colour that follows the summary.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use typhos::alarm::scope::resolve;
use typhos::alarm::{
    create_alarm_indicator, AlarmAggregator, AlarmChange, AlarmColor, AlarmLevel, Kind, KindLevel,
    ShapeKind,
};
use typhos::device::{Component, Device, SignalSpec, StaticDevice};
use typhos::error::TyphosError;
use typhos::mock::MockTransport;

// =============================================================================
// Helpers
// =============================================================================

fn setup() -> (MockTransport, AlarmAggregator) {
    let transport = MockTransport::new();
    let aggregator = AlarmAggregator::new(Arc::new(transport.clone()));
    (transport, aggregator)
}

fn hinted(name: &str, addresses: &[&str]) -> Arc<dyn Device> {
    let mut device = StaticDevice::new(name);
    for (i, address) in addresses.iter().enumerate() {
        device = device
            .with_signal(SignalSpec::new(format!("ch{}", i), Kind::Hinted).with_address(*address));
    }
    Arc::new(device)
}

/// Device with one signal of each kind.
fn layered() -> StaticDevice {
    StaticDevice::new("slits")
        .with_signal(SignalSpec::new("width", Kind::Hinted).with_address("ca://SL:WIDTH"))
        .with_signal(SignalSpec::new("center", Kind::Normal).with_address("ca://SL:CENTER"))
        .with_signal(SignalSpec::new("speed", Kind::Config).with_address("ca://SL:SPEED"))
        .with_signal(SignalSpec::new("raw", Kind::Omitted).with_address("ca://SL:RAW"))
        .with_component(
            StaticDevice::new("slits_top")
                .with_signal(SignalSpec::new("readback", Kind::Hinted).with_address("ca://SL:TOP"))
                .with_signal(SignalSpec::new("offset", Kind::Config)),
        )
}

/// Device whose component list can be made to fail on demand.
struct Flaky {
    inner: StaticDevice,
    failing: AtomicBool,
}

impl Flaky {
    fn new(inner: StaticDevice, failing: bool) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(failing),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Device for Flaky {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn components(&self) -> Result<Vec<Component>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("component lookup timed out"));
        }
        self.inner.components()
    }
}

fn drain(rx: &mut broadcast::Receiver<AlarmChange>) -> Vec<AlarmChange> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

// =============================================================================
// Scope
// =============================================================================

#[test]
fn test_tier_nesting() {
    let device = layered();
    let sizes: Vec<usize> = KindLevel::ALL
        .iter()
        .map(|level| resolve(&device, *level).unwrap().len())
        .collect();
    assert_eq!(sizes, vec![2, 3, 5, 6]);

    for (i, lower) in KindLevel::ALL.iter().enumerate() {
        for upper in &KindLevel::ALL[i..] {
            let a = resolve(&device, *lower).unwrap();
            let b = resolve(&device, *upper).unwrap();
            assert!(a.is_subset(&b), "{} not within {}", lower, upper);
        }
    }
}

// =============================================================================
// Attach / detach
// =============================================================================

#[test]
fn test_idempotent_attach() {
    let (transport, mut aggregator) = setup();
    let device = hinted("det", &["ca://A", "ca://B"]);

    aggregator.attach(device.clone()).unwrap();
    let channels: Vec<String> = aggregator.channels().iter().map(|s| s.to_string()).collect();
    let summary = aggregator.summary();

    aggregator.attach(device).unwrap();
    assert_eq!(aggregator.channels(), channels);
    assert_eq!(aggregator.summary(), summary);
    assert_eq!(aggregator.owner_count("ca://A"), 1);
    assert_eq!(transport.open_count("ca://A"), 1);
}

#[test]
fn test_reference_counting() {
    let (transport, mut aggregator) = setup();
    aggregator.attach(hinted("left", &["ca://L", "ca://SHARED"])).unwrap();
    aggregator.attach(hinted("right", &["ca://R", "ca://SHARED"])).unwrap();

    assert_eq!(transport.open_count("ca://SHARED"), 1);
    assert_eq!(aggregator.owner_count("ca://SHARED"), 2);

    assert!(aggregator.detach("left"));
    assert_eq!(transport.active_count("ca://SHARED"), 1);
    assert_eq!(transport.close_count("ca://SHARED"), 0);
    assert_eq!(transport.close_count("ca://L"), 1);
    assert_eq!(aggregator.channels(), vec!["ca://R", "ca://SHARED"]);

    assert!(aggregator.detach("right"));
    assert_eq!(transport.close_count("ca://SHARED"), 1);
    assert!(aggregator.channels().is_empty());
    assert!(aggregator.channel_state("ca://SHARED").is_none());
    assert!(transport.open_addresses().is_empty());
}

#[test]
fn test_detach_unknown_device_is_noop() {
    let (_transport, mut aggregator) = setup();
    let mut changes = aggregator.subscribe_changes();
    assert!(!aggregator.detach("ghost"));
    assert!(drain(&mut changes).is_empty());
    assert_eq!(aggregator.summary(), AlarmLevel::NoAlarm);
}

#[test]
fn test_detach_removes_stale_states() {
    let (transport, mut aggregator) = setup();
    aggregator.attach(hinted("healthy", &["ca://OK"])).unwrap();
    aggregator.attach(hinted("broken", &["ca://DOWN"])).unwrap();
    transport.connect_with("ca://OK", 0);
    aggregator.process_pending();
    assert_eq!(aggregator.summary(), AlarmLevel::Disconnected);

    aggregator.detach("broken");
    assert_eq!(aggregator.summary(), AlarmLevel::NoAlarm);
}

#[test]
fn test_failed_attach_leaves_aggregator_untouched() {
    let (transport, mut aggregator) = setup();
    transport.connect_with("ca://OK", 1);
    aggregator.attach(hinted("healthy", &["ca://OK"])).unwrap();
    assert_eq!(aggregator.summary(), AlarmLevel::Minor);
    let mut changes = aggregator.subscribe_changes();

    let broken = StaticDevice::new("broken")
        .with_signal(SignalSpec::new("rbv", Kind::Hinted).with_address("ca://BROKEN:RBV"));
    let err = aggregator
        .attach(Arc::new(Flaky::new(broken, true)))
        .unwrap_err();
    match err {
        TyphosError::Resolution { device, reason } => {
            assert_eq!(device, "broken");
            assert!(reason.contains("timed out"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(aggregator.devices(), vec!["healthy"]);
    assert_eq!(aggregator.channels(), vec!["ca://OK"]);
    assert_eq!(aggregator.summary(), AlarmLevel::Minor);
    assert!(drain(&mut changes).is_empty());
    assert_eq!(transport.open_count("ca://BROKEN:RBV"), 0);
    assert_eq!(transport.open_addresses(), vec!["ca://OK".to_string()]);
}

// =============================================================================
// Summary rules
// =============================================================================

#[test]
fn test_disconnect_override() {
    let (transport, mut aggregator) = setup();
    aggregator.attach(hinted("det", &["ca://A", "ca://B"])).unwrap();
    transport.connect_with("ca://A", 1);
    aggregator.process_pending();

    assert!(aggregator.channel_state("ca://A").unwrap().connected);
    assert!(!aggregator.channel_state("ca://B").unwrap().connected);
    assert_eq!(aggregator.summary(), AlarmLevel::Disconnected);
}

#[test]
fn test_max_severity() {
    let (transport, mut aggregator) = setup();
    aggregator
        .attach(hinted("det", &["ca://A", "ca://B", "ca://C"]))
        .unwrap();
    transport.connect_with("ca://A", 0);
    transport.connect_with("ca://B", 2);
    transport.connect_with("ca://C", 1);
    aggregator.process_pending();
    assert_eq!(aggregator.summary(), AlarmLevel::Major);
}

#[test]
fn test_empty_scope() {
    let (_transport, mut aggregator) = setup();
    assert_eq!(aggregator.summary(), AlarmLevel::NoAlarm);

    // Only config signals, nothing in scope at the hinted tier.
    let quiet = StaticDevice::new("quiet")
        .with_signal(SignalSpec::new("gain", Kind::Config).with_address("ca://Q:GAIN"));
    aggregator.attach(Arc::new(quiet)).unwrap();
    assert!(aggregator.channels().is_empty());
    assert_eq!(aggregator.summary(), AlarmLevel::NoAlarm);
}

#[test]
fn test_severity_before_connection_is_informational() {
    let (transport, mut aggregator) = setup();
    aggregator.attach(hinted("det", &["ca://A"])).unwrap();
    transport.set_severity("ca://A", 2);
    aggregator.process_pending();
    assert_eq!(aggregator.summary(), AlarmLevel::Disconnected);

    transport.set_connected("ca://A", true);
    aggregator.process_pending();
    assert_eq!(aggregator.summary(), AlarmLevel::Major);
}

#[test]
fn test_change_suppression() {
    let (transport, mut aggregator) = setup();
    aggregator.attach(hinted("det", &["ca://A", "ca://B"])).unwrap();
    transport.connect_with("ca://A", 0);
    transport.connect_with("ca://B", 0);
    aggregator.process_pending();

    let mut changes = aggregator.subscribe_changes();

    // Same value again: nothing fires.
    transport.set_severity("ca://A", 0);
    aggregator.process_pending();
    assert!(drain(&mut changes).is_empty());

    // Raised on one channel while the other stays lower: one change.
    transport.set_severity("ca://A", 1);
    aggregator.process_pending();
    let fired = drain(&mut changes);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].previous, AlarmLevel::NoAlarm);
    assert_eq!(fired[0].current, AlarmLevel::Minor);

    // Second channel reaches the same level: summary unchanged.
    transport.set_severity("ca://B", 1);
    aggregator.process_pending();
    assert!(drain(&mut changes).is_empty());
}

#[test]
fn test_rejected_address_does_not_block_others() {
    let (transport, mut aggregator) = setup();
    transport.reject("ca://NOPE");
    aggregator
        .attach(hinted("det", &["ca://A", "ca://NOPE"]))
        .unwrap();
    transport.connect_with("ca://A", 2);
    aggregator.process_pending();

    assert!(aggregator.channel_state("ca://A").unwrap().connected);
    assert_eq!(
        aggregator.channel_state("ca://A").unwrap().severity,
        AlarmLevel::Major
    );
    assert_eq!(aggregator.summary(), AlarmLevel::Disconnected);
}

// =============================================================================
// Rescoping
// =============================================================================

#[test]
fn test_set_kind_level_same_value_is_noop() {
    let (transport, mut aggregator) = setup();
    aggregator.attach(Arc::new(layered())).unwrap();
    let opens = transport.open_count("ca://SL:WIDTH");
    aggregator.set_kind_level(KindLevel::Hinted);
    assert_eq!(transport.open_count("ca://SL:WIDTH"), opens);
}

#[test]
fn test_atomic_rescope_without_flash() {
    let (transport, mut aggregator) = setup();
    for address in ["ca://SL:WIDTH", "ca://SL:CENTER", "ca://SL:TOP"] {
        transport.connect_with(address, 0);
    }
    aggregator.attach(Arc::new(layered())).unwrap();
    assert_eq!(aggregator.summary(), AlarmLevel::NoAlarm);

    let mut changes = aggregator.subscribe_changes();

    // Hinted -> Normal adds a channel the transport already has connected:
    // NoAlarm before and after, with no Disconnected in between.
    aggregator.set_kind_level(KindLevel::Normal);
    assert_eq!(aggregator.channels().len(), 3);
    assert_eq!(aggregator.summary(), AlarmLevel::NoAlarm);
    assert_eq!(aggregator.process_pending(), 0);
    assert!(drain(&mut changes).is_empty());

    // Normal -> Hinted only drops a channel.
    aggregator.set_kind_level(KindLevel::Hinted);
    assert!(drain(&mut changes).is_empty());
    assert_eq!(aggregator.summary(), AlarmLevel::NoAlarm);

    // Retained channels kept their subscription.
    assert_eq!(transport.open_count("ca://SL:WIDTH"), 1);
    assert_eq!(transport.close_count("ca://SL:WIDTH"), 0);
    assert_eq!(transport.close_count("ca://SL:CENTER"), 1);
}

#[test]
fn test_rescope_fires_at_most_once() {
    let (transport, mut aggregator) = setup();
    transport.connect_with("ca://SL:WIDTH", 0);
    transport.connect_with("ca://SL:TOP", 0);
    aggregator.attach(Arc::new(layered())).unwrap();
    aggregator.process_pending();

    let mut changes = aggregator.subscribe_changes();
    aggregator.set_kind_level(KindLevel::Omitted);
    let fired = drain(&mut changes);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].current, AlarmLevel::Disconnected);
    assert_eq!(aggregator.channels().len(), 6);
    assert!(aggregator
        .channels()
        .contains(&"sig://slits.slits_top.offset"));
}

#[test]
fn test_rescope_keeps_shared_channels_open() {
    let (transport, mut aggregator) = setup();
    let a = StaticDevice::new("a")
        .with_signal(SignalSpec::new("x", Kind::Hinted).with_address("ca://SHARED"));
    let b = StaticDevice::new("b")
        .with_signal(SignalSpec::new("x", Kind::Normal).with_address("ca://SHARED"));
    aggregator.attach(Arc::new(a)).unwrap();
    aggregator.attach(Arc::new(b)).unwrap();
    assert_eq!(aggregator.owner_count("ca://SHARED"), 1);

    aggregator.set_kind_level(KindLevel::Normal);
    assert_eq!(aggregator.owner_count("ca://SHARED"), 2);
    aggregator.set_kind_level(KindLevel::Hinted);
    assert_eq!(aggregator.owner_count("ca://SHARED"), 1);
    assert_eq!(transport.open_count("ca://SHARED"), 1);
    assert_eq!(transport.close_count("ca://SHARED"), 0);
}

#[test]
fn test_rescope_keeps_scope_of_device_that_fails_to_resolve() {
    let (transport, mut aggregator) = setup();
    let flaky = Arc::new(Flaky::new(
        StaticDevice::new("flaky")
            .with_signal(SignalSpec::new("h", Kind::Hinted).with_address("ca://F:H"))
            .with_signal(SignalSpec::new("n", Kind::Normal).with_address("ca://F:N")),
        false,
    ));
    aggregator.attach(Arc::new(layered())).unwrap();
    aggregator.attach(flaky.clone()).unwrap();

    flaky.set_failing(true);
    aggregator.set_kind_level(KindLevel::Normal);

    // The healthy device moved to the new tier, the failing one did not.
    assert_eq!(aggregator.kind_level(), KindLevel::Normal);
    assert_eq!(
        aggregator.device_channels("slits"),
        Some(vec!["ca://SL:CENTER", "ca://SL:TOP", "ca://SL:WIDTH"])
    );
    assert_eq!(aggregator.device_channels("flaky"), Some(vec!["ca://F:H"]));
    assert_eq!(transport.open_count("ca://F:N"), 0);
    assert_eq!(transport.active_count("ca://F:H"), 1);

    // Once it resolves again the next rescope picks it up.
    flaky.set_failing(false);
    aggregator.set_kind_level(KindLevel::Config);
    assert_eq!(
        aggregator.device_channels("flaky"),
        Some(vec!["ca://F:H", "ca://F:N"])
    );
}

// =============================================================================
// End to end
// =============================================================================

#[test]
fn test_end_to_end_indicator() {
    let (transport, mut aggregator) = setup();
    let mut indicator = create_alarm_indicator(ShapeKind::Circle, &aggregator);
    assert_eq!(indicator.color(), AlarmColor::Green);

    let device = StaticDevice::new("camera")
        .with_signal(SignalSpec::new("acquire", Kind::Hinted).with_address("ca://CAM:ACQ"))
        .with_signal(SignalSpec::new("temp", Kind::Hinted).with_address("ca://CAM:TEMP"))
        .with_signal(SignalSpec::new("rate", Kind::Hinted).with_address("ca://CAM:RATE"))
        .with_signal(SignalSpec::new("gain", Kind::Config).with_address("ca://CAM:GAIN"));
    let mut changes = aggregator.subscribe_changes();
    aggregator.attach(Arc::new(device)).unwrap();
    assert_eq!(aggregator.channels().len(), 3);

    indicator.update();
    assert_eq!(indicator.color(), AlarmColor::White);

    transport.connect_with("ca://CAM:ACQ", 0);
    transport.connect_with("ca://CAM:TEMP", 0);
    transport.connect_with("ca://CAM:RATE", 1);
    aggregator.process_pending();

    let levels: Vec<AlarmLevel> = drain(&mut changes).iter().map(|c| c.current).collect();
    assert_eq!(levels.first(), Some(&AlarmLevel::Disconnected));
    assert_eq!(levels.last(), Some(&AlarmLevel::Minor));
    assert!(indicator.update());
    assert_eq!(indicator.color(), AlarmColor::Yellow);

    transport.set_connected("ca://CAM:TEMP", false);
    aggregator.process_pending();
    assert_eq!(aggregator.summary(), AlarmLevel::Disconnected);
    assert!(indicator.update());
    assert_eq!(indicator.color(), AlarmColor::White);
}
