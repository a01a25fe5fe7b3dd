//! Integration tests for hotplug monitoring, including its independence
//! from in-flight transfers.
//!
//! Run with: cargo test -p engine --test monitor_tests

use engine::test_utils::MockTransport;
use engine::{DeviceIdentity, DeviceSession, HotplugEvent, HotplugMonitor};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const HWJ: DeviceIdentity = DeviceIdentity {
    vendor_id: 0x0483,
    product_id: 0x5750,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds an observer that forwards every event into an mpsc channel.
fn collector() -> (
    impl FnMut(HotplugEvent) + Send + 'static,
    mpsc::Receiver<HotplugEvent>,
) {
    let (tx, rx) = mpsc::channel();
    (
        move |event| {
            let _ = tx.send(event);
        },
        rx,
    )
}

// ============================================================================
// Filtered delivery
// ============================================================================

#[test]
fn vendor_filter_delivers_matching_events_exactly_once() {
    let transport = MockTransport::new();
    let monitor = HotplugMonitor::new(transport.clone());
    let (observer, rx) = collector();

    monitor
        .start(DeviceIdentity::new(0x0483, 0), observer)
        .expect("start");

    transport.emit(HotplugEvent::Arrival {
        identity: DeviceIdentity::new(0x1a2b, 0x0001),
    });
    transport.emit(HotplugEvent::Arrival { identity: HWJ });
    transport.emit(HotplugEvent::Removal { identity: HWJ });

    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("arrival"),
        HotplugEvent::Arrival { identity: HWJ }
    );
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("removal"),
        HotplugEvent::Removal { identity: HWJ }
    );
    assert!(monitor.stop());
    assert!(rx.try_recv().is_err(), "foreign event leaked past the filter");
}

#[test]
fn repeated_events_are_not_coalesced() {
    let transport = MockTransport::new();
    let monitor = HotplugMonitor::new(transport.clone());
    let (observer, rx) = collector();

    monitor.start(DeviceIdentity::ANY, observer).expect("start");

    // Flaky cables produce arrival bursts; every observation is forwarded.
    for _ in 0..3 {
        transport.emit(HotplugEvent::Arrival { identity: HWJ });
    }
    for _ in 0..3 {
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).expect("burst event"),
            HotplugEvent::Arrival { identity: HWJ }
        );
    }
    assert!(monitor.stop());
}

// ============================================================================
// Independence from transfers
// ============================================================================

#[test]
fn events_are_delivered_while_a_transfer_is_in_flight() {
    let transport = MockTransport::with_device(HWJ);
    transport.set_max_packet_size(4);
    transport.set_write_delay(Duration::from_millis(20));

    let session = Arc::new(DeviceSession::new(transport.clone()));
    let monitor = HotplugMonitor::new(transport.clone());
    assert_eq!(session.connect(HWJ), Ok(true));

    let (observer, rx) = collector();
    monitor.start(DeviceIdentity::ANY, observer).expect("start");

    // 40 chunks at 20ms each keep the serialization lock busy for ~800ms.
    let sender = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.send(&[0u8; 160]))
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while transport.writes().is_empty() {
        assert!(Instant::now() < deadline, "transfer never started");
        thread::sleep(Duration::from_millis(1));
    }

    transport.emit(HotplugEvent::Removal { identity: HWJ });
    let received = rx
        .recv_timeout(Duration::from_millis(250))
        .expect("event observed during transfer");
    assert_eq!(received, HotplugEvent::Removal { identity: HWJ });

    assert_eq!(sender.join().expect("join"), Ok(160));
    assert!(monitor.stop());
    assert!(session.disconnect());
}

#[test]
fn monitor_and_session_share_a_transport_without_contention() {
    let transport = MockTransport::with_device(HWJ);
    transport.push_read(b"0;");

    let session = DeviceSession::new(transport.clone());
    let monitor = HotplugMonitor::new(transport.clone());

    let (observer, rx) = collector();
    monitor.start(DeviceIdentity::new(0x0483, 0), observer).expect("start");
    assert_eq!(session.connect(HWJ), Ok(true));

    transport.emit(HotplugEvent::Arrival { identity: HWJ });
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("arrival"),
        HotplugEvent::Arrival { identity: HWJ }
    );

    let reply = session
        .send_with_response(b"USBS;", Duration::from_millis(100))
        .expect("status reply");
    assert_eq!(reply, b"0;");

    assert!(session.disconnect());
    assert!(monitor.stop());
}

// ============================================================================
// Error reporting
// ============================================================================

#[test]
fn monitoring_errors_reach_the_observer_after_start() {
    let transport = MockTransport::new();
    let monitor = HotplugMonitor::new(transport.clone());
    let (observer, rx) = collector();

    monitor
        .start(DeviceIdentity::new(0x0483, 0x5750), observer)
        .expect("start");

    transport.emit(HotplugEvent::Error {
        message: "event thread lost the bus".to_string(),
    });

    match rx.recv_timeout(RECV_TIMEOUT).expect("error event") {
        HotplugEvent::Error { message } => assert_eq!(message, "event thread lost the bus"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(monitor.stop());
}
