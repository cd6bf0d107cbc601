// Simulated Adapter Tests
// Call journal, synchronous rejection, outstanding accounting and auto responses

use gattq::session::OperationKind;
use gattq::transport::{
    AdapterCall, AdapterError, AdapterEvent, AdapterEventSink, AdapterStatus, CacheClear, Device,
    DeviceAddress, GattAdapter, LinkBehavior, SimulatedAdapter, SubscriptionMode, TargetId,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn target() -> TargetId {
    TargetId::new(Uuid::from_u128(0x180D), Uuid::from_u128(0x2A37))
}

fn recording_sink() -> (AdapterEventSink, Arc<Mutex<Vec<AdapterEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    let sink = AdapterEventSink::new(move |event| {
        log.lock().unwrap().push(event);
        true
    });
    (sink, events)
}

fn connected(adapter: &SimulatedAdapter, device: &Device) -> Arc<Mutex<Vec<AdapterEvent>>> {
    let (sink, events) = recording_sink();
    adapter.connect(device, false, sink).unwrap();
    adapter.establish_link(device.address());
    events
}

// ============================================================================
// MANUAL MODE
// ============================================================================

#[test]
fn test_calls_are_journaled_in_order() {
    let adapter = SimulatedAdapter::new();
    let device = Device::new("aa:bb:cc:dd:ee:01");
    let _events = connected(&adapter, &device);

    adapter.read(device.address(), &target()).unwrap();
    adapter.write(device.address(), &target(), &[1, 2]).unwrap();

    let calls = adapter.calls();
    assert!(matches!(calls[0], AdapterCall::Connect { auto_connect: false, .. }));
    assert!(matches!(calls[1], AdapterCall::Read { .. }));
    assert_eq!(
        calls[2],
        AdapterCall::Write {
            device: DeviceAddress::new("AA:BB:CC:DD:EE:01"),
            target: target(),
            payload: vec![1, 2],
        }
    );
    assert_eq!(adapter.operations().len(), 2);
}

#[test]
fn test_disabled_adapter_refuses_everything() {
    let adapter = SimulatedAdapter::new();
    adapter.set_enabled(false);
    let (sink, _events) = recording_sink();

    assert!(!adapter.is_enabled());
    assert_eq!(
        adapter.connect(&Device::new("AA:BB:CC:DD:EE:01"), false, sink),
        Err(AdapterError::Unavailable)
    );
    assert!(adapter.calls().is_empty());
}

#[test]
fn test_rejected_kind_is_recorded_but_refused() {
    let adapter = SimulatedAdapter::new();
    let device = Device::new("AA:BB:CC:DD:EE:01");
    let _events = connected(&adapter, &device);
    adapter.reject(OperationKind::Subscribe(SubscriptionMode::Notify));

    let result = adapter.subscribe(device.address(), &target(), SubscriptionMode::Notify);
    assert!(matches!(result, Err(AdapterError::Rejected(_))));
    assert_eq!(adapter.count(OperationKind::Subscribe(SubscriptionMode::Notify)), 1);
    assert_eq!(adapter.outstanding(device.address()), 0);

    adapter.accept(OperationKind::Subscribe(SubscriptionMode::Notify));
    assert!(adapter
        .subscribe(device.address(), &target(), SubscriptionMode::Notify)
        .is_ok());
}

#[test]
fn test_operation_without_link_is_refused() {
    let adapter = SimulatedAdapter::new();
    let result = adapter.read(&DeviceAddress::new("AA:BB:CC:DD:EE:01"), &target());
    assert_eq!(result, Err(AdapterError::NotLinked));
}

#[test]
fn test_outstanding_high_water_mark() {
    let adapter = SimulatedAdapter::new();
    let device = Device::new("AA:BB:CC:DD:EE:01");
    let _events = connected(&adapter, &device);

    adapter.read(device.address(), &target()).unwrap();
    adapter.read_signal_strength(device.address()).unwrap();
    assert_eq!(adapter.outstanding(device.address()), 2);

    adapter.emit(
        device.address(),
        AdapterEvent::ReadComplete {
            target: target(),
            status: AdapterStatus::SUCCESS,
            value: vec![],
        },
    );
    assert_eq!(adapter.outstanding(device.address()), 1);
    assert_eq!(adapter.max_outstanding(), 2);
}

#[test]
fn test_disconnect_reports_link_loss_only_when_linked() {
    let adapter = SimulatedAdapter::new();
    let device = Device::new("AA:BB:CC:DD:EE:01");
    let events = connected(&adapter, &device);
    assert!(adapter.is_linked(device.address()));

    adapter.disconnect(device.address()).unwrap();
    adapter.disconnect(device.address()).unwrap();

    let lost = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, AdapterEvent::LinkLost { .. }))
        .count();
    assert_eq!(lost, 1);
    assert!(!adapter.is_linked(device.address()));
}

#[test]
fn test_close_drops_sink() {
    let adapter = SimulatedAdapter::new();
    let device = Device::new("AA:BB:CC:DD:EE:01");
    let _events = connected(&adapter, &device);

    adapter.close(device.address());
    assert!(!adapter.push(device.address(), target(), vec![1]));
}

#[test]
fn test_clear_cache_outcome() {
    let device = DeviceAddress::new("AA:BB:CC:DD:EE:01");
    assert_eq!(SimulatedAdapter::new().clear_cache(&device), CacheClear::Unsupported);

    let adapter = SimulatedAdapter::new().with_cache_clear(CacheClear::Failed);
    assert_eq!(adapter.clear_cache(&device), CacheClear::Failed);
    assert_eq!(adapter.calls(), vec![AdapterCall::ClearCache { device }]);
}

// ============================================================================
// AUTO MODE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_auto_mode_establishes_and_answers() {
    let adapter = SimulatedAdapter::new()
        .auto_respond(Duration::from_millis(10))
        .with_value(target(), vec![0x48]);
    let device = Device::new("AA:BB:CC:DD:EE:01");
    let (sink, events) = recording_sink();

    adapter.connect(&device, true, sink).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(events.lock().unwrap().as_slice(), &[AdapterEvent::LinkEstablished]);

    adapter.read(device.address(), &target()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&AdapterEvent::ReadComplete {
            target: target(),
            status: AdapterStatus::SUCCESS,
            value: vec![0x48],
        })
    );
    assert_eq!(adapter.outstanding(device.address()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_auto_mode_failing_link() {
    let adapter = SimulatedAdapter::new()
        .auto_respond(Duration::from_millis(10))
        .with_link_behavior(LinkBehavior::Fail(AdapterStatus(133)));
    let device = Device::new("AA:BB:CC:DD:EE:01");
    let (sink, events) = recording_sink();

    adapter.connect(&device, false, sink).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        events.lock().unwrap().as_slice(),
        &[AdapterEvent::LinkLost {
            status: AdapterStatus(133)
        }]
    );
    assert!(!adapter.is_linked(device.address()));
}

#[tokio::test(start_paused = true)]
async fn test_auto_mode_written_value_is_read_back() {
    let adapter = SimulatedAdapter::new().auto_respond(Duration::from_millis(5));
    let device = Device::new("AA:BB:CC:DD:EE:01");
    let (sink, events) = recording_sink();
    adapter.connect(&device, false, sink).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    adapter.write(device.address(), &target(), &[7, 7]).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    adapter.read(device.address(), &target()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(
        events.lock().unwrap().last(),
        Some(AdapterEvent::ReadComplete { value, .. }) if value == &vec![7, 7]
    ));
}
