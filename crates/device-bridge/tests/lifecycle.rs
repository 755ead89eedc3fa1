//! Connection lifecycle driven through the bridge monitor

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use devlink_device_bridge::{
    ConnectionState, DeviceChange, DeviceEvent, DeviceRegistry, DeviceStartListener, DeviceType,
};

const WAIT: Duration = Duration::from_secs(2);

/// Target states of every transition published for `serial`
fn walk(events: &[DeviceEvent], serial: &str) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::StateChanged { serial: s, to, .. } if s == serial => Some(to.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn physical_device_walks_to_ready() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 2000), &transport).await;
    let events = context.subscribe();

    let device = FakeDevice::physical("R58M123").ready();
    device.set_property("ro.build.version.sdk", "34");
    device.set_property("ro.product.model", "SM_G991B");
    transport.attach(device);

    assert!(wait_until(WAIT, || context.tracker().is_ready("R58M123")).await);

    let events = events.drain();
    assert_eq!(
        walk(&events, "R58M123"),
        vec![
            ConnectionState::Connecting,
            ConnectionState::WaitingForPackageManager,
            ConnectionState::Ready,
        ]
    );
    assert!(events.contains(&DeviceEvent::Connected {
        serial: "R58M123".into()
    }));
    assert!(events.contains(&DeviceEvent::Ready {
        serial: "R58M123".into(),
        name: "R58M123".into()
    }));

    let profile = context.registry().get("R58M123").unwrap();
    assert_eq!(profile.device_type(), DeviceType::Physical);
    assert_eq!(profile.api_level(), Some(34));
    assert_eq!(profile.target_hash().as_deref(), Some("android-34"));
    assert_eq!(profile.display_name(), "SM G991B");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emulator_waits_for_avd_name() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;
    let events = context.subscribe();

    let device = FakeDevice::emulator("emulator-5554", None).ready();
    transport.attach(device.clone());

    let tracker = context.tracker();
    assert!(
        wait_until(WAIT, || tracker.state("emulator-5554") == ConnectionState::WaitingForAvdName).await
    );
    assert_eq!(tracker.name_of("emulator-5554"), None);

    device.set_avd_name("Pixel_7_API_34");
    assert!(wait_until(WAIT, || tracker.is_ready("Pixel_7_API_34")).await);

    assert_eq!(
        walk(&events.drain(), "emulator-5554"),
        vec![
            ConnectionState::Connecting,
            ConnectionState::WaitingForAvdName,
            ConnectionState::WaitingForPackageManager,
            ConnectionState::Ready,
        ]
    );
    assert_eq!(tracker.serial_of("Pixel_7_API_34").as_deref(), Some("emulator-5554"));

    let profile = context.registry().get("Pixel_7_API_34").unwrap();
    assert!(profile.is_emulator());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn not_ready_keeps_polling_until_booted() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;

    let device = FakeDevice::physical("R58M123");
    transport.attach(device.clone());

    assert!(wait_until(WAIT, || device.command_count(BOOT_PROBE) >= 3).await);
    assert_eq!(
        context.tracker().state("R58M123"),
        ConnectionState::WaitingForPackageManager
    );

    // booted but the package manager is still starting
    device.set_booted(true);
    assert!(wait_until(WAIT, || device.command_count(PM_PROBE) >= 2).await);
    assert!(!context.tracker().is_ready("R58M123"));

    device.set_pm_ready(true);
    assert!(wait_until(WAIT, || context.tracker().is_ready("R58M123")).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_fails_within_two_polls() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(20, 20), &transport).await;

    let device = FakeDevice::physical("R58M123");
    transport.attach(device.clone());

    let tracker = context.tracker();
    assert!(wait_until(WAIT, || matches!(tracker.state("R58M123"), ConnectionState::Failed(_))).await);
    assert_eq!(
        tracker.state("R58M123"),
        ConnectionState::Failed("timeout waiting for package manager".into())
    );
    assert!(device.command_count(BOOT_PROBE) <= 2);

    // the poll is gone
    let probes = device.command_count(BOOT_PROBE);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.command_count(BOOT_PROBE), probes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn avd_name_never_resolves() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 40), &transport).await;

    transport.attach(FakeDevice::emulator("emulator-5556", None).ready());

    let tracker = context.tracker();
    assert!(wait_until(WAIT, || tracker.state("emulator-5556").is_terminal()).await);
    assert_eq!(
        tracker.state("emulator-5556"),
        ConnectionState::Failed("timeout waiting for AVD name".into())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_probe_fails_immediately() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;

    let device = FakeDevice::physical("R58M123");
    device.reply(BOOT_PROBE, ShellReply::Reject("device offline".into()));
    transport.attach(device.clone());

    let tracker = context.tracker();
    assert!(wait_until(WAIT, || tracker.state("R58M123").is_terminal()).await);
    match tracker.state("R58M123") {
        ConnectionState::Failed(reason) => assert!(reason.contains("device offline"), "{}", reason),
        other => panic!("expected Failed, got {}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(device.command_count(BOOT_PROBE), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_timeout_is_transient() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 10_000), &transport).await;

    let device = FakeDevice::physical("R58M123");
    device.reply(BOOT_PROBE, ShellReply::Hang);
    transport.attach(device.clone());

    assert!(wait_until(WAIT, || device.command_count(BOOT_PROBE) >= 2).await);
    assert_eq!(
        context.tracker().state("R58M123"),
        ConnectionState::WaitingForPackageManager
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_while_waiting_fails_the_launch() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;
    let events = context.subscribe();
    let tracker = context.tracker();

    let listener = RecordingListener::new();
    let as_listener: Arc<dyn DeviceStartListener> = listener.clone();
    tracker.register_launch("R58M123", as_listener, None);

    let device = FakeDevice::physical("R58M123");
    transport.attach(device.clone());
    assert!(
        wait_until(WAIT, || tracker.state("R58M123") == ConnectionState::WaitingForPackageManager).await
    );

    transport.detach("R58M123");
    assert!(wait_until(WAIT, || !listener.calls().is_empty()).await);
    assert_eq!(listener.calls(), vec!["error:Device R58M123 disconnected".to_string()]);
    assert_eq!(tracker.state("R58M123"), ConnectionState::Disconnected);
    assert_eq!(tracker.name_of("R58M123"), None);

    // a late poll must not revive the device or signal again
    device.set_booted(true);
    device.set_pm_ready(true);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(tracker.state("R58M123"), ConnectionState::Disconnected);
    assert_eq!(listener.calls().len(), 1);

    let walk = walk(&events.drain(), "R58M123");
    assert_eq!(
        &walk[walk.len() - 2..],
        &[
            ConnectionState::Failed("device disconnected".into()),
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_reuses_the_profile() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;
    let tracker = context.tracker();

    let device = FakeDevice::physical("R58M123").ready();
    transport.attach(device.clone());
    assert!(wait_until(WAIT, || tracker.is_ready("R58M123")).await);
    let first = context.registry().get("R58M123").unwrap();

    transport.detach("R58M123");
    assert!(wait_until(WAIT, || tracker.state("R58M123") == ConnectionState::Disconnected).await);
    assert!(context.registry().contains("R58M123"));

    transport.attach(device);
    assert!(wait_until(WAIT, || tracker.is_ready("R58M123")).await);

    let second = context.registry().get("R58M123").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(context.registry().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failure_report_signals_once_and_disconnects() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;
    let tracker = context.tracker();

    transport.attach(FakeDevice::physical("R58M123").ready());
    assert!(wait_until(WAIT, || tracker.is_ready("R58M123")).await);

    let listener = RecordingListener::new();
    tracker.register_launch("R58M123", listener.clone(), None);

    tracker.report_device_failure("R58M123", "install failed");
    tracker.report_device_failure("R58M123", "install failed again");

    assert_eq!(listener.calls(), vec!["error:install failed".to_string()]);
    assert_eq!(tracker.state("R58M123"), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_device_starts_when_it_comes_online() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;
    let tracker = context.tracker();

    let device = FakeDevice::physical("R58M123").ready().offline();
    transport.attach(device.clone());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(tracker.state("R58M123"), ConnectionState::Disconnected);
    assert!(context.monitor().is_device_offline("R58M123").await);

    device.set_online(true);
    transport.change(&device, DeviceChange::STATE);
    assert!(wait_until(WAIT, || tracker.is_ready("R58M123")).await);
    assert!(context.monitor().is_device_online("R58M123").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_device_going_offline_is_no_longer_ready() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;
    let events = context.subscribe();
    let tracker = context.tracker();

    let device = FakeDevice::physical("R58M123").ready();
    transport.attach(device.clone());
    assert!(wait_until(WAIT, || tracker.is_ready("R58M123")).await);

    device.set_online(false);
    transport.change(&device, DeviceChange::STATE);
    assert!(wait_until(WAIT, || tracker.state("R58M123") == ConnectionState::Disconnected).await);
    assert!(!tracker.is_ready("R58M123"));
    assert_eq!(tracker.serial_of("R58M123").as_deref(), Some("R58M123"));

    device.set_online(true);
    transport.change(&device, DeviceChange::STATE);
    assert!(wait_until(WAIT, || tracker.is_ready("R58M123")).await);

    assert_eq!(
        walk(&events.drain(), "R58M123"),
        vec![
            ConnectionState::Connecting,
            ConnectionState::WaitingForPackageManager,
            ConnectionState::Ready,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::WaitingForPackageManager,
            ConnectionState::Ready,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn going_offline_while_waiting_fails_the_launch() {
    let transport = FakeTransport::new();
    let context = started_context(fast_config(10, 5000), &transport).await;
    let events = context.subscribe();
    let tracker = context.tracker();

    let listener = RecordingListener::new();
    tracker.register_launch("R58M123", listener.clone(), None);

    let device = FakeDevice::physical("R58M123");
    transport.attach(device.clone());
    assert!(
        wait_until(WAIT, || tracker.state("R58M123") == ConnectionState::WaitingForPackageManager).await
    );

    device.set_online(false);
    transport.change(&device, DeviceChange::STATE);
    assert!(wait_until(WAIT, || !listener.calls().is_empty()).await);
    assert_eq!(listener.calls(), vec!["error:Device R58M123 went offline".to_string()]);
    assert!(wait_until(WAIT, || tracker.state("R58M123") == ConnectionState::Disconnected).await);

    // the cancelled poll must not finish the walk
    device.set_booted(true);
    device.set_pm_ready(true);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(tracker.state("R58M123"), ConnectionState::Disconnected);
    assert_eq!(listener.calls().len(), 1);

    let walk = walk(&events.drain(), "R58M123");
    assert_eq!(
        &walk[walk.len() - 2..],
        &[
            ConnectionState::Failed("device offline".into()),
            ConnectionState::Disconnected,
        ]
    );
}

#[test]
fn registry_lookup_is_idempotent_across_threads() {
    let registry = Arc::new(DeviceRegistry::new());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.get_or_create_emulator_profile("Pixel_7"))
        })
        .collect();
    let profiles: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(profiles.iter().all(|p| Arc::ptr_eq(p, &profiles[0])));
    assert_eq!(registry.len(), 1);
}
