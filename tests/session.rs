mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{advance, Duration, Instant};

use ryse_shade::device::backend::BleCentral;
use ryse_shade::device::connection::ConnectionSettings;
use ryse_shade::device::constants::{make_rx_uuid, make_tx_uuid};
use ryse_shade::device::observer::OnUnavailable;
use ryse_shade::device::session::{SessionConfig, ShadeSession};
use ryse_shade::device::types::{Advertisement, ConnectionState, DeviceAddress, Telemetry};
use ryse_shade::error::{ConnectionError, SessionError};

use common::{address, advertisement, settle, FakeCentral, FakeLink, Recorder};

fn session(central: Arc<dyn BleCentral>) -> ShadeSession {
    ShadeSession::new(address(), central, SessionConfig::default())
}

fn observed(session: &ShadeSession) -> Arc<Recorder> {
    let recorder = Recorder::new();
    session.add_position_observer(recorder.position_observer());
    session.add_battery_observer(recorder.battery_observer());
    session.add_unavailable_observer(recorder.unavailable_observer());
    recorder
}

#[tokio::test]
async fn set_position_connects_and_writes_the_command() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));

    session.set_position(50).await.unwrap();

    assert_eq!(link.connects(), 1);
    assert_eq!(session.connection_state(), ConnectionState::Connected);
    let writes = link.writes.lock().unwrap().clone();
    assert_eq!(writes, vec![(make_tx_uuid(), vec![0xF5, 0x03, 0x01, 0x01, 0x32, 0x34])]);
}

#[tokio::test]
async fn convenience_commands_write_their_positions() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));

    session.open().await.unwrap();
    session.close().await.unwrap();
    session.set_open_percentage(25).await.unwrap();
    session.request_position().await.unwrap();

    let written = link.written();
    assert_eq!(written[0][4], 0);
    assert_eq!(written[1][4], 100);
    assert_eq!(written[2][4], 75);
    assert_eq!(written[3], vec![0xF5, 0x02, 0x01, 0x03, 0x04]);
    assert_eq!(link.connects(), 1);
}

#[tokio::test]
async fn out_of_range_position_is_rejected_before_connecting() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));

    for position in [-1, 101, 1000] {
        let err = session.set_position(position).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument { .. }), "{:?}", err);
    }
    assert!(session.set_open_percentage(101).await.is_err());

    assert_eq!(link.connects(), 0);
    assert!(link.written().is_empty());
}

#[tokio::test]
async fn operations_after_shutdown_fail_without_touching_the_shade() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);

    session.shutdown().await;

    let err = session.set_position(10).await.unwrap_err();
    assert!(err.is_shut_down(), "{:?}", err);
    assert!(session.poll().await.unwrap_err().is_shut_down());
    assert!(matches!(session.connect().await, Err(ConnectionError::ShutDown)));

    session.handle_advertisement(&advertisement(&[0x00, 40, 80]));
    settle().await;

    assert_eq!(link.connects(), 0);
    assert!(link.written().is_empty());
    assert_eq!(session.position(), None);
    assert!(recorder.positions().is_empty());
    assert_eq!(recorder.unavailable_count(), 0);
}

#[tokio::test]
async fn advertisement_updates_cache_and_observers_without_connecting() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);

    session.handle_advertisement(&advertisement(&[0x00, 40, 80]));

    // the cache is updated synchronously; observers run on the session's task
    assert_eq!(session.telemetry(), Telemetry { position: Some(40), battery: Some(80) });
    assert_eq!(session.open_percentage(), Some(60));
    settle().await;

    assert_eq!(recorder.positions(), vec![40]);
    assert_eq!(recorder.batteries(), vec![80]);
    assert_eq!(link.connects(), 0);
}

#[tokio::test]
async fn advertisements_of_other_devices_are_ignored() {
    let session = session(FakeCentral::new(FakeLink::new()));

    let mut other = advertisement(&[0x00, 40, 80]);
    other.address = DeviceAddress::new("11:22:33:44:55:66");
    session.handle_advertisement(&other);

    let foreign_company = Advertisement::new(address(), None, [(0x004C, vec![0x00, 40, 80])].into());
    session.handle_advertisement(&foreign_company);

    assert_eq!(session.telemetry(), Telemetry::default());
}

#[tokio::test]
async fn framed_position_inside_advertisement() {
    let session = session(FakeCentral::new(FakeLink::new()));

    session.handle_advertisement(&advertisement(&[0xF5, 0x03, 0x01, 0x07, 0x25]));
    assert_eq!(session.telemetry(), Telemetry { position: Some(0x25), battery: None });

    session.handle_advertisement(&advertisement(&[0xF5, 0x03, 0x01, 0x18, 0x60]));
    assert_eq!(session.position(), Some(0x25));
}

#[tokio::test]
async fn malformed_values_are_dropped() {
    let session = session(FakeCentral::new(FakeLink::new()));

    session.handle_advertisement(&advertisement(&[0x00, 140, 200]));
    assert_eq!(session.telemetry(), Telemetry::default());

    session.handle_advertisement(&advertisement(&[0x00]));
    assert_eq!(session.telemetry(), Telemetry::default());
}

#[tokio::test(start_paused = true)]
async fn most_recent_observation_wins() {
    let link = FakeLink::new();
    link.set_read_value(&[0x00, 70, 90]);
    let session = session(FakeCentral::new(link.clone()));

    let before_poll = Instant::now();
    advance(Duration::from_secs(1)).await;
    session.poll().await.unwrap();
    assert_eq!(session.position(), Some(70));

    // observed before the poll completed: stale
    session.handle_advertisement(&advertisement(&[0x00, 10, 50]).observed_at(before_poll));
    assert_eq!(session.telemetry(), Telemetry { position: Some(70), battery: Some(90) });

    // observed after: wins, even though the value is lower
    advance(Duration::from_secs(1)).await;
    session.handle_advertisement(&advertisement(&[0x00, 20, 50]));
    assert_eq!(session.telemetry(), Telemetry { position: Some(20), battery: Some(50) });
}

#[tokio::test]
async fn position_notifications_update_the_cache() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);
    session.connect().await.unwrap();

    link.notify(make_rx_uuid(), &[0xF5, 0x03, 0x01, 0x07, 0x42]);
    settle().await;
    assert_eq!(session.position(), Some(66));
    assert_eq!(recorder.positions(), vec![66]);

    // user target echoes and other characteristics carry no telemetry
    link.notify(make_rx_uuid(), &[0xF5, 0x03, 0x01, 0x18, 0x10]);
    link.notify(make_tx_uuid(), &[0xF5, 0x03, 0x01, 0x07, 0x11]);
    link.notify(make_rx_uuid(), &[0x01, 0x02]);
    settle().await;

    assert_eq!(session.position(), Some(66));
    assert_eq!(recorder.positions(), vec![66]);
}

#[tokio::test]
async fn strict_checksum_drops_unverified_reports() {
    let link = FakeLink::new();
    let config = SessionConfig { strict_checksum: true, ..SessionConfig::default() };
    let session = ShadeSession::new(address(), FakeCentral::new(link.clone()), config);
    session.connect().await.unwrap();

    link.notify(make_rx_uuid(), &[0xF5, 0x03, 0x01, 0x07, 0x42]);
    settle().await;
    assert_eq!(session.position(), None);

    // 01 + 07 + 42 = 4a
    link.notify(make_rx_uuid(), &[0xF5, 0x04, 0x01, 0x07, 0x42, 0x4A]);
    settle().await;
    assert_eq!(session.position(), Some(0x42));
}

#[tokio::test]
async fn strict_checksum_advertisement_without_checksum_is_dropped() {
    let link = FakeLink::new();
    let config = SessionConfig { strict_checksum: true, connect_on_pairing_mode: true, ..SessionConfig::default() };
    let session = ShadeSession::new(address(), FakeCentral::new(link.clone()), config);
    let recorder = observed(&session);

    // without the frame check F5 reads as a pairing flag and 03/01 as position/battery
    session.handle_advertisement(&advertisement(&[0xF5, 0x03, 0x01, 0x07, 0x42]));
    settle().await;

    assert_eq!(session.telemetry(), Telemetry::default());
    assert!(recorder.positions().is_empty());
    assert!(recorder.batteries().is_empty());
    assert_eq!(link.connects(), 0);
}

#[tokio::test]
async fn unrecognised_frames_in_advertisements_are_ignored() {
    let link = FakeLink::new();
    let config = SessionConfig { connect_on_pairing_mode: true, ..SessionConfig::default() };
    let session = ShadeSession::new(address(), FakeCentral::new(link.clone()), config);

    session.handle_advertisement(&advertisement(&[0xF5, 0x02, 0x01, 0x07]));
    session.handle_advertisement(&advertisement(&[0xF5, 0x03, 0x01, 0x09, 0x42]));
    settle().await;

    assert_eq!(session.telemetry(), Telemetry::default());
    assert_eq!(link.connects(), 0);
}

#[tokio::test]
async fn read_data_drops_user_target_reports() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));

    link.set_read_value(&[0xF5, 0x03, 0x01, 0x18, 0x10]);
    assert_eq!(session.read_data().await.unwrap(), None);

    link.set_read_value(&[0xF5, 0x03, 0x01, 0x07, 0x10]);
    assert_eq!(session.read_data().await.unwrap(), Some(vec![0xF5, 0x03, 0x01, 0x07, 0x10]));
}

#[tokio::test]
async fn poll_reads_position_and_battery() {
    let link = FakeLink::new();
    link.set_read_value(&[0x00, 30, 77]);
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);

    assert_eq!(session.poll().await.unwrap(), Telemetry { position: Some(30), battery: Some(77) });
    assert_eq!(session.get_battery().await.unwrap(), Some(77));
    assert_eq!(session.get_position().await.unwrap(), Some(30));
    settle().await;

    assert_eq!(recorder.positions(), vec![30, 30, 30]);
    assert_eq!(recorder.batteries(), vec![77, 77, 77]);
}

#[tokio::test]
async fn battery_level_is_read_when_connecting() {
    let link = FakeLink::new();
    link.set_battery_value(64);
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);

    session.connect().await.unwrap();
    settle().await;

    assert_eq!(session.battery_level(), Some(64));
    assert_eq!(recorder.batteries(), vec![64]);
    assert!(recorder.positions().is_empty());
}

#[tokio::test]
async fn get_battery_prefers_the_battery_level_characteristic() {
    let link = FakeLink::new();
    link.set_battery_value(55);
    link.set_read_value(&[0x00, 30, 77]);
    let session = session(FakeCentral::new(link.clone()));

    assert_eq!(session.get_battery().await.unwrap(), Some(55));
    assert_eq!(session.battery_level(), Some(55));
    assert_eq!(session.position(), None);
}

#[tokio::test]
async fn get_battery_polls_when_battery_level_is_turned_off() {
    let link = FakeLink::new();
    link.set_battery_value(55);
    link.set_read_value(&[0x00, 30, 77]);
    let connection = ConnectionSettings { battery_characteristic: None, ..ConnectionSettings::default() };
    let config = SessionConfig { connection, ..SessionConfig::default() };
    let session = ShadeSession::new(address(), FakeCentral::new(link.clone()), config);

    assert_eq!(session.get_battery().await.unwrap(), Some(77));
    assert_eq!(session.position(), Some(30));
    assert_eq!(session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn failed_write_degrades_the_link_and_next_write_reconnects() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);
    session.set_position(10).await.unwrap();

    link.fail_writes(true);
    let err = session.set_position(20).await.unwrap_err();
    assert!(matches!(err, SessionError::Transport { .. }), "{:?}", err);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    link.fail_writes(false);
    session.set_position(30).await.unwrap();
    settle().await;

    assert_eq!(link.connects(), 2);
    assert_eq!(link.written().len(), 2);
    assert_eq!(recorder.unavailable_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_shade_reports_unavailable() {
    let session = session(FakeCentral::empty());
    let recorder = observed(&session);

    let err = session.set_position(10).await.unwrap_err();

    assert!(matches!(err, SessionError::NotConnected { source: ConnectionError::NoDeviceHandle }), "{:?}", err);
    settle().await;
    assert_eq!(recorder.unavailable_count(), 1);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn restore_seeds_the_cache_below_real_observations() {
    let session = session(FakeCentral::new(FakeLink::new()));
    let recorder = observed(&session);
    assert!(!session.wait_ready(Duration::from_millis(100)).await);

    session.restore(Telemetry { position: Some(50), battery: Some(60) });
    assert!(session.wait_ready(Duration::from_millis(100)).await);
    assert_eq!(session.telemetry(), Telemetry { position: Some(50), battery: Some(60) });

    session.handle_advertisement(&advertisement(&[0x00, 10, 20]));
    session.restore(Telemetry { position: Some(99), battery: Some(99) });
    assert_eq!(session.telemetry(), Telemetry { position: Some(10), battery: Some(20) });
    settle().await;

    assert_eq!(recorder.positions(), vec![50, 10]);
    assert_eq!(recorder.batteries(), vec![60, 20]);
}

#[tokio::test]
async fn wait_ready_resolves_on_first_advertisement() {
    let session = session(FakeCentral::new(FakeLink::new()));

    let waiter = {
        let session = session.clone();
        tokio::spawn(async move { session.wait_ready(Duration::from_secs(5)).await })
    };
    settle().await;
    session.handle_advertisement(&advertisement(&[0x00, 40, 80]));

    assert!(waiter.await.unwrap());
}

#[tokio::test]
async fn pairing_mode_triggers_a_connect_when_enabled() {
    let link = FakeLink::new();
    let config = SessionConfig { connect_on_pairing_mode: true, ..SessionConfig::default() };
    let session = ShadeSession::new(address(), FakeCentral::new(link.clone()), config);

    session.handle_advertisement(&advertisement(&[0x40, 30, 50]));
    settle().await;

    assert_eq!(link.connects(), 1);
    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert_eq!(session.position(), Some(30));
}

#[tokio::test]
async fn pairing_mode_is_ignored_by_default() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));

    session.handle_advertisement(&advertisement(&[0x40, 30, 50]));
    settle().await;

    assert_eq!(link.connects(), 0);
}

#[tokio::test]
async fn unpair_releases_the_link() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);

    session.pair().await.unwrap();
    session.unpair().await;
    settle().await;

    assert_eq!(link.disconnects(), 1);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(recorder.unavailable_count(), 1);
}

#[tokio::test]
async fn unavailable_observers_run_on_the_session_task() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    session.connect().await.unwrap();

    let inside = Arc::new(AtomicBool::new(false));
    let seen_inside = Arc::new(Mutex::new(Vec::new()));
    {
        let inside = inside.clone();
        let seen_inside = seen_inside.clone();
        session.add_unavailable_observer(Arc::new(OnUnavailable(move || {
            seen_inside.lock().unwrap().push(inside.load(Ordering::SeqCst));
        })));
    }

    inside.store(true, Ordering::SeqCst);
    link.drop_connection();
    session.handle_peer_disconnect();
    inside.store(false, Ordering::SeqCst);
    assert!(seen_inside.lock().unwrap().is_empty());

    settle().await;
    assert_eq!(*seen_inside.lock().unwrap(), vec![false]);
}

#[tokio::test]
async fn availability_follows_advertisements_and_disconnects() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);
    assert!(!session.is_available());

    session.handle_advertisement(&advertisement(&[0x00, 40, 80]));
    settle().await;
    assert!(session.is_available());
    assert_eq!(recorder.available_count(), 1);

    session.handle_advertisement(&advertisement(&[0x00, 41, 80]));
    session.connect().await.unwrap();
    settle().await;
    assert_eq!(recorder.available_count(), 1);

    link.drop_connection();
    session.handle_peer_disconnect();
    settle().await;
    assert!(!session.is_available());
    assert_eq!(recorder.unavailable_count(), 1);

    // the shade comes back before the reconnect is due
    session.handle_advertisement(&advertisement(&[0x00, 42, 80]));
    settle().await;
    assert!(session.is_available());
    assert_eq!(recorder.available_count(), 2);
    assert_eq!(recorder.unavailable_count(), 1);
}

#[tokio::test]
async fn successful_connect_reports_available() {
    let link = FakeLink::new();
    let session = session(FakeCentral::new(link.clone()));
    let recorder = observed(&session);

    session.connect().await.unwrap();
    settle().await;

    assert!(session.is_available());
    assert_eq!(recorder.available_count(), 1);
    assert_eq!(recorder.unavailable_count(), 0);
}
