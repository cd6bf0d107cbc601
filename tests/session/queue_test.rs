// Operation Queue Tests
// Single-flight dispatch, ordering, timeouts, rejections and capability checks

use gattq::manager::{GattConfig, GattManager};
use gattq::session::{GattError, GattEvent, OperationKind, Subscriber};
use gattq::transport::{
    AdapterCall, AdapterEvent, AdapterStatus, AttributeProfile, Device, DeviceAddress,
    ServiceProfile, SimulatedAdapter, TargetId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

const DEVICE: &str = "AA:BB:CC:DD:EE:01";

fn address() -> DeviceAddress {
    DeviceAddress::new(DEVICE)
}

fn service() -> Uuid {
    Uuid::from_u128(0x180D)
}

fn attribute(n: u128) -> Uuid {
    Uuid::from_u128(0x2A00 + n)
}

fn target(n: u128) -> TargetId {
    TargetId::new(service(), attribute(n))
}

fn config() -> GattConfig {
    GattConfig::new().with_discovery_delay_ms(0)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn next(rx: &mut UnboundedReceiver<GattEvent>) -> GattEvent {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscriber channel closed")
}

async fn connected(adapter: &SimulatedAdapter, config: GattConfig) -> (GattManager, UnboundedReceiver<GattEvent>) {
    let manager = GattManager::new(Arc::new(adapter.clone()), config).unwrap();
    let (owner, mut rx) = Subscriber::channel();
    manager.connect(&Device::new(DEVICE), None, owner).unwrap();
    settle().await;
    assert!(adapter.bring_up(&address()));
    assert_eq!(next(&mut rx).await, GattEvent::ConnectStarted);
    assert!(matches!(next(&mut rx).await, GattEvent::Connected { .. }));
    (manager, rx)
}

fn read_complete(n: u128, value: Vec<u8>) -> AdapterEvent {
    AdapterEvent::ReadComplete {
        target: target(n),
        status: AdapterStatus::SUCCESS,
        value,
    }
}

// ============================================================================
// SINGLE FLIGHT AND ORDERING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_flight_under_load() {
    let adapter = SimulatedAdapter::new().auto_respond(Duration::from_millis(15));
    let (manager, _owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    for n in 0..10 {
        manager.read(&address(), service(), attribute(n), caller.clone()).unwrap();
        manager
            .write(&address(), service(), attribute(n), vec![n as u8 + 1], caller.clone())
            .unwrap();
    }
    manager.read_signal_strength(&address(), caller.clone()).unwrap();
    manager.set_transfer_size(&address(), 185, caller).unwrap();

    for _ in 0..22 {
        assert!(!next(&mut results).await.is_failure());
    }
    assert_eq!(adapter.max_outstanding(), 1);
    assert_eq!(adapter.operations().len(), 22);
}

#[tokio::test(start_paused = true)]
async fn test_read_then_write_ordering() {
    let adapter = SimulatedAdapter::new()
        .auto_respond(Duration::from_millis(10))
        .with_value(target(1), vec![0xAA]);
    let (manager, _owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    manager.read(&address(), service(), attribute(1), caller.clone()).unwrap();
    manager
        .write(&address(), service(), attribute(1), vec![0xBB], caller)
        .unwrap();

    assert_eq!(next(&mut results).await, GattEvent::Read(vec![0xAA]));
    assert_eq!(next(&mut results).await, GattEvent::Written(vec![0xBB]));

    let ops = adapter.operations();
    assert!(matches!(ops[0], AdapterCall::Read { .. }));
    assert!(matches!(ops[1], AdapterCall::Write { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_next_command_waits_for_completion() {
    let adapter = SimulatedAdapter::new();
    let (manager, _owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    manager.read(&address(), service(), attribute(1), caller.clone()).unwrap();
    manager.read(&address(), service(), attribute(2), caller).unwrap();
    settle().await;
    assert_eq!(adapter.operations().len(), 1);

    adapter.emit(&address(), read_complete(1, vec![1]));
    assert_eq!(next(&mut results).await, GattEvent::Read(vec![1]));
    settle().await;
    assert_eq!(adapter.operations().len(), 2);
    assert_eq!(adapter.outstanding(&address()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_same_key_requests_share_one_primitive() {
    let adapter = SimulatedAdapter::new();
    let (manager, _owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    manager.read(&address(), service(), attribute(1), caller.clone()).unwrap();
    manager.read(&address(), service(), attribute(1), caller).unwrap();
    settle().await;

    adapter.emit(&address(), read_complete(1, vec![9]));
    assert_eq!(next(&mut results).await, GattEvent::Read(vec![9]));
    assert_eq!(next(&mut results).await, GattEvent::Read(vec![9]));
    assert_eq!(adapter.count(OperationKind::Read), 1);
}

#[tokio::test(start_paused = true)]
async fn test_independent_callers_get_their_own_reads() {
    let adapter = SimulatedAdapter::new();
    let (manager, _owner) = connected(&adapter, config()).await;
    let (a, mut a_rx) = Subscriber::channel();
    let (b, mut b_rx) = Subscriber::channel();

    manager.read(&address(), service(), attribute(1), a).unwrap();
    manager.read(&address(), service(), attribute(1), b).unwrap();
    settle().await;

    adapter.emit(&address(), read_complete(1, vec![1]));
    assert_eq!(next(&mut a_rx).await, GattEvent::Read(vec![1]));
    settle().await;
    assert!(b_rx.try_recv().is_err());

    adapter.emit(&address(), read_complete(1, vec![2]));
    assert_eq!(next(&mut b_rx).await, GattEvent::Read(vec![2]));
    assert_eq!(adapter.count(OperationKind::Read), 2);
}

// ============================================================================
// TIMEOUTS AND LATE COMPLETIONS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_no_late_delivery_after_timeout() {
    let adapter = SimulatedAdapter::new();
    let (manager, _owner) = connected(&adapter, config().with_operation_timeout_ms(1_000)).await;
    let (first, mut first_rx) = Subscriber::channel();
    let (second, mut second_rx) = Subscriber::channel();

    manager.read(&address(), service(), attribute(1), first).unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    manager.read(&address(), service(), attribute(2), second).unwrap();

    assert_eq!(next(&mut first_rx).await, GattEvent::Failed(GattError::OperationTimeout));
    settle().await;
    assert_eq!(adapter.operations().len(), 2);

    // Late answer to the timed-out read
    adapter.emit(&address(), read_complete(1, vec![1]));
    settle().await;
    assert!(first_rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());

    adapter.emit(&address(), read_complete(2, vec![2]));
    assert_eq!(next(&mut second_rx).await, GattEvent::Read(vec![2]));
}

#[tokio::test(start_paused = true)]
async fn test_completion_with_nothing_in_flight_is_ignored() {
    let adapter = SimulatedAdapter::new();
    let (manager, mut owner) = connected(&adapter, config()).await;

    adapter.emit(&address(), read_complete(1, vec![1]));
    settle().await;

    assert!(owner.try_recv().is_err());
    assert!(manager.is_connected(&address()));
}

#[tokio::test(start_paused = true)]
async fn test_failure_status_is_reported() {
    let adapter = SimulatedAdapter::new();
    let (manager, _owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    manager.read(&address(), service(), attribute(1), caller).unwrap();
    settle().await;
    adapter.emit(
        &address(),
        AdapterEvent::ReadComplete {
            target: target(1),
            status: AdapterStatus(137),
            value: vec![],
        },
    );

    assert_eq!(next(&mut results).await, GattEvent::Failed(GattError::OperationFailure(137)));
}

// ============================================================================
// REJECTION AND CAPABILITIES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_synchronous_rejection_advances_queue() {
    let adapter = SimulatedAdapter::new().auto_respond(Duration::from_millis(10));
    let (manager, _owner) = connected(&adapter, config()).await;
    adapter.reject(OperationKind::Read);
    let (caller, mut results) = Subscriber::channel();

    manager.read(&address(), service(), attribute(1), caller.clone()).unwrap();
    manager
        .write(&address(), service(), attribute(1), vec![5], caller)
        .unwrap();

    assert!(matches!(
        next(&mut results).await,
        GattEvent::Failed(GattError::Rejected {
            operation: OperationKind::Read,
            ..
        })
    ));
    assert_eq!(next(&mut results).await, GattEvent::Written(vec![5]));
}

fn profile() -> Vec<ServiceProfile> {
    vec![ServiceProfile::new(service())
        .with_attribute(
            AttributeProfile::new(attribute(1))
                .with_read()
                .with_notify()
                .with_descriptor(Uuid::from_u128(0x2902)),
        )
        .with_attribute(AttributeProfile::new(attribute(2)).with_write_without_response())]
}

#[tokio::test(start_paused = true)]
async fn test_capability_checks() {
    let adapter = SimulatedAdapter::new().with_services(profile());
    let (manager, _owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    manager
        .write(&address(), service(), attribute(1), vec![1], caller.clone())
        .unwrap();
    assert_eq!(
        next(&mut results).await,
        GattEvent::Failed(GattError::UnsupportedOperation {
            operation: OperationKind::Write,
            target: target(1),
        })
    );

    manager.read(&address(), service(), attribute(9), caller.clone()).unwrap();
    assert_eq!(
        next(&mut results).await,
        GattEvent::Failed(GattError::AttributeNotFound(target(9)))
    );

    manager
        .read_descriptor(&address(), service(), attribute(1), Uuid::from_u128(0x2901), caller.clone())
        .unwrap();
    assert!(matches!(
        next(&mut results).await,
        GattEvent::Failed(GattError::AttributeNotFound(_))
    ));

    manager
        .indicate(&address(), service(), attribute(1), caller.clone())
        .unwrap();
    assert!(matches!(
        next(&mut results).await,
        GattEvent::Failed(GattError::UnsupportedOperation { .. })
    ));

    // Nothing refused by the profile ever reaches the adapter
    assert!(adapter.operations().is_empty());

    manager
        .write(&address(), service(), attribute(2), vec![1], caller)
        .unwrap();
    settle().await;
    assert_eq!(adapter.count(OperationKind::Write), 1);
}

#[tokio::test(start_paused = true)]
async fn test_descriptor_and_link_operations() {
    let descriptor = Uuid::from_u128(0x2902);
    let adapter = SimulatedAdapter::new()
        .auto_respond(Duration::from_millis(10))
        .with_services(profile())
        .with_rssi(-42)
        .with_value(target(1).with_descriptor(descriptor), vec![1, 0]);
    let (manager, _owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    manager
        .read_descriptor(&address(), service(), attribute(1), descriptor, caller.clone())
        .unwrap();
    manager.read_signal_strength(&address(), caller.clone()).unwrap();
    manager.set_transfer_size(&address(), 247, caller).unwrap();

    assert_eq!(next(&mut results).await, GattEvent::Descriptor(vec![1, 0]));
    assert_eq!(next(&mut results).await, GattEvent::SignalStrength(-42));
    assert_eq!(next(&mut results).await, GattEvent::TransferSize(247));
}

// ============================================================================
// SYNCHRONOUS MISUSE AND TEARDOWN
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_misuse_is_returned_not_queued() {
    let adapter = SimulatedAdapter::new();
    let (manager, _owner) = connected(&adapter, config()).await;
    let caller = Subscriber::channel().0;

    assert!(matches!(
        manager.write(&address(), service(), attribute(1), vec![], caller.clone()),
        Err(GattError::EmptyPayload)
    ));
    assert!(matches!(
        manager.set_transfer_size(&address(), 22, caller.clone()),
        Err(GattError::InvalidTransferSize(22))
    ));
    assert!(matches!(
        manager.set_transfer_size(&address(), 513, caller.clone()),
        Err(GattError::InvalidTransferSize(513))
    ));
    assert!(matches!(
        manager.read(&DeviceAddress::new("11:22:33:44:55:66"), service(), attribute(1), caller.clone()),
        Err(GattError::DeviceNotConnected)
    ));

    adapter.set_enabled(false);
    assert!(matches!(
        manager.read(&address(), service(), attribute(1), caller),
        Err(GattError::TransportUnavailable)
    ));

    settle().await;
    assert!(adapter.operations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_fails_pending_commands() {
    let adapter = SimulatedAdapter::new();
    let (manager, mut owner) = connected(&adapter, config()).await;
    let (caller, mut results) = Subscriber::channel();

    for n in 1..=3 {
        manager.read(&address(), service(), attribute(n), caller.clone()).unwrap();
    }
    settle().await;
    adapter.lose_link(&address(), AdapterStatus(8));

    assert_eq!(
        next(&mut owner).await,
        GattEvent::Disconnected {
            active: false,
            status: AdapterStatus(8)
        }
    );
    for _ in 0..3 {
        assert_eq!(next(&mut results).await, GattEvent::Failed(GattError::DeviceNotConnected));
    }
    settle().await;
    assert!(results.try_recv().is_err());
    assert!(matches!(
        manager.read(&address(), service(), attribute(1), caller),
        Err(GattError::DeviceNotConnected)
    ));
}
