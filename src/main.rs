// gattq - Drive the GATT core against the simulated radio
//
// Connects a handful of simulated sensors, runs every operation kind through
// the single-flight queue, shares one notification subscription between two
// subscribers and shuts everything down again.

use clap::Parser;
use gattq::manager::{GattConfig, GattManager, ReconnectStrategy};
use gattq::session::{GattError, GattEvent, Subscriber};
use gattq::transport::{
    AdapterStatus, AttributeProfile, Device, DeviceAddress, LinkBehavior, ServiceProfile,
    SimulatedAdapter, TargetId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use uuid::Uuid;

const SENSOR_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
const MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
const CONTROL_POINT: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);
const CLIENT_CONFIG: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

const EVENT_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "gattq")]
#[command(version, about = "Exercise the single-flight GATT core against a simulated radio", long_about = None)]
struct Cli {
    /// Number of simulated devices to connect, one after another
    #[arg(short, long, default_value_t = 2)]
    devices: usize,

    /// Simulated radio latency per primitive
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Values pushed on the shared subscription
    #[arg(long, default_value_t = 5)]
    pushes: u8,

    #[arg(long, default_value_t = 5_000)]
    operation_timeout_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    #[arg(long, default_value_t = 0)]
    reconnect_count: u32,

    #[arg(long, default_value_t = 200)]
    reconnect_interval_ms: u64,

    /// Grow the retry delay exponentially instead of keeping it fixed
    #[arg(long)]
    exponential: bool,

    #[arg(long, default_value_t = 0)]
    discovery_delay_ms: u64,

    /// Make every link fail with status 133 to exercise the retry path
    #[arg(long)]
    failing_link: bool,
}

impl Cli {
    fn config(&self) -> GattConfig {
        let strategy = if self.exponential {
            ReconnectStrategy::Exponential
        } else {
            ReconnectStrategy::Fixed
        };
        GattConfig::new()
            .with_operation_timeout_ms(self.operation_timeout_ms)
            .with_connect_timeout_ms(self.connect_timeout_ms)
            .with_reconnect_count(self.reconnect_count)
            .with_reconnect_interval_ms(self.reconnect_interval_ms)
            .with_reconnect_strategy(strategy)
            .with_discovery_delay_ms(self.discovery_delay_ms)
    }
}

fn sensor_profile() -> ServiceProfile {
    ServiceProfile::new(SENSOR_SERVICE)
        .with_attribute(
            AttributeProfile::new(MEASUREMENT)
                .with_read()
                .with_notify()
                .with_descriptor(CLIENT_CONFIG),
        )
        .with_attribute(AttributeProfile::new(CONTROL_POINT).with_write())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();
    config.validate()?;

    let adapter = SimulatedAdapter::new()
        .auto_respond(Duration::from_millis(cli.latency_ms))
        .with_services(vec![sensor_profile()])
        .with_value(TargetId::new(SENSOR_SERVICE, MEASUREMENT), vec![0x00, 0x48])
        .with_value(
            TargetId::new(SENSOR_SERVICE, MEASUREMENT).with_descriptor(CLIENT_CONFIG),
            vec![0x01, 0x00],
        );
    if cli.failing_link {
        adapter.set_link_behavior(LinkBehavior::Fail(AdapterStatus(133)));
    }

    let manager = GattManager::new(Arc::new(adapter.clone()), config)?;
    info!(devices = cli.devices, "starting");

    for n in 0..cli.devices {
        let device = Device::new(&format!("C0:FF:EE:00:00:{:02X}", n))
            .with_name(&format!("sensor-{}", n));
        match run_device(&manager, &adapter, &device, cli.pushes).await {
            Ok(()) => {}
            Err(error) if error.is_connection_error() => {
                warn!(device = %device, %error, "could not connect")
            }
            Err(error) => warn!(device = %device, %error, "scenario aborted"),
        }
    }

    manager.shutdown().await;
    info!(
        primitives = adapter.calls().len(),
        max_outstanding = adapter.max_outstanding(),
        "done"
    );
    Ok(())
}

async fn run_device(
    manager: &GattManager,
    adapter: &SimulatedAdapter,
    device: &Device,
    pushes: u8,
) -> Result<(), GattError> {
    let address = device.address();
    let (owner, mut lifecycle) = Subscriber::channel();
    manager.connect(device, None, owner)?;

    loop {
        match expect_ok(&mut lifecycle).await? {
            GattEvent::Connected { services } => {
                info!(device = %device, services = services.len(), "connected");
                break;
            }
            event => info!(device = %device, event = %describe(&event), "lifecycle"),
        }
    }

    // One of every operation kind, answered strictly in order
    let (caller, mut results) = Subscriber::channel();
    manager.read(address, SENSOR_SERVICE, MEASUREMENT, caller.clone())?;
    manager.write(address, SENSOR_SERVICE, CONTROL_POINT, vec![0x01], caller.clone())?;
    manager.read_descriptor(address, SENSOR_SERVICE, MEASUREMENT, CLIENT_CONFIG, caller.clone())?;
    manager.read_signal_strength(address, caller.clone())?;
    manager.set_transfer_size(address, 247, caller)?;
    for _ in 0..5 {
        let event = expect_ok(&mut results).await?;
        info!(device = %device, event = %describe(&event), "result");
    }

    share_subscription(manager, adapter, address, pushes).await?;

    manager.disconnect(address);
    loop {
        if let GattEvent::Disconnected { active, status } = next_event(&mut lifecycle).await? {
            info!(device = %device, active, %status, "disconnected");
            return Ok(());
        }
    }
}

/// Two subscribers on one attribute: one transport subscribe, every push seen twice
async fn share_subscription(
    manager: &GattManager,
    adapter: &SimulatedAdapter,
    address: &DeviceAddress,
    pushes: u8,
) -> Result<(), GattError> {
    let (first, mut first_rx) = Subscriber::channel();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let second = Subscriber::from_fn(move |event| {
        if let GattEvent::Notified(_) = event {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    manager.subscribe(address, SENSOR_SERVICE, MEASUREMENT, first.clone())?;
    manager.subscribe(address, SENSOR_SERVICE, MEASUREMENT, second.clone())?;
    expect_ok(&mut first_rx).await?;

    let target = TargetId::new(SENSOR_SERVICE, MEASUREMENT);
    for n in 0..pushes {
        adapter.push(address, target, vec![0x00, 0x40 + n]);
    }
    for _ in 0..pushes {
        let event = expect_ok(&mut first_rx).await?;
        info!(device = %address, event = %describe(&event), "push");
    }

    manager.unsubscribe(address, SENSOR_SERVICE, MEASUREMENT, second)?;
    manager.unsubscribe(address, SENSOR_SERVICE, MEASUREMENT, first)?;
    expect_ok(&mut first_rx).await?;
    info!(
        device = %address,
        second_subscriber = seen.load(Ordering::Relaxed),
        "subscription released"
    );
    Ok(())
}

async fn next_event(rx: &mut UnboundedReceiver<GattEvent>) -> Result<GattEvent, GattError> {
    match tokio::time::timeout(EVENT_WAIT, rx.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(GattError::DeviceNotConnected),
        Err(_) => Err(GattError::OperationTimeout),
    }
}

async fn expect_ok(rx: &mut UnboundedReceiver<GattEvent>) -> Result<GattEvent, GattError> {
    let event = next_event(rx).await?;
    match event.error() {
        Some(error) => Err(error.clone()),
        None => Ok(event),
    }
}

fn describe(event: &GattEvent) -> String {
    match event {
        GattEvent::Read(value) => format!("read {}", hex::encode(value)),
        GattEvent::Written(value) => format!("written {}", hex::encode(value)),
        GattEvent::Notified(value) => format!("notified {}", hex::encode(value)),
        GattEvent::Descriptor(value) => format!("descriptor {}", hex::encode(value)),
        GattEvent::SignalStrength(rssi) => format!("rssi {} dBm", rssi),
        GattEvent::TransferSize(size) => format!("transfer size {}", size),
        other => format!("{:?}", other),
    }
}
