//! Hotplug monitoring.
//!
//! The transport reports raw arrival/removal notifications from its own
//! event thread. The monitor bridges them over an unbounded channel to a
//! pump thread it owns, applies the caller's identity filter there, and
//! hands matching events to the registered observer:
//!
//! ```text
//! transport event thread ──channel──▶ hotplug-pump ──filter──▶ observer
//! ```
//!
//! The observer therefore never runs on the transport thread, and
//! delivery shares no lock with the session or transfer path, so
//! monitoring keeps flowing while a transfer is in flight.

use crate::error::{EngineError, Result};
use crate::identity::DeviceIdentity;
use crate::transport::Transport;
use async_channel::Receiver;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// A device arrival/removal notification, or a post-start subscription
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device appeared on the bus.
    Arrival { identity: DeviceIdentity },
    /// A previously present device went away.
    Removal { identity: DeviceIdentity },
    /// The subscription hit a failure after monitoring started.
    Error { message: String },
}

impl HotplugEvent {
    /// The identity carried by `Arrival`/`Removal`; `None` for `Error`.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        match self {
            HotplugEvent::Arrival { identity } | HotplugEvent::Removal { identity } => {
                Some(*identity)
            }
            HotplugEvent::Error { .. } => None,
        }
    }
}

/// Receives filtered hotplug events while the monitor is active.
///
/// Called on the monitor's pump thread; implementations should hand off
/// rather than do long work inline, or arrival bursts will queue up.
pub trait HotplugObserver: Send {
    fn on_event(&mut self, event: HotplugEvent);
}

impl<F> HotplugObserver for F
where
    F: FnMut(HotplugEvent) + Send,
{
    fn on_event(&mut self, event: HotplugEvent) {
        self(event)
    }
}

struct ActiveMonitor<S> {
    subscription: S,
    pump: JoinHandle<()>,
}

/// Watches the bus for arrivals/removals matching a filter.
///
/// Independent of any [`DeviceSession`](crate::session::DeviceSession):
/// the monitor keeps delivering while transfers are in flight and never
/// waits on them.
pub struct HotplugMonitor<T: Transport> {
    transport: T,
    active: Mutex<Option<ActiveMonitor<T::Subscription>>>,
}

impl<T: Transport> HotplugMonitor<T> {
    /// Creates an idle monitor over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            active: Mutex::new(None),
        }
    }

    /// Starts monitoring, delivering events matching `filter` (zero
    /// fields are wildcards) to `observer` until [`stop`](Self::stop).
    ///
    /// Fails with [`EngineError::AlreadyMonitoring`] while active and
    /// with [`EngineError::Subscription`] when the transport refuses the
    /// subscription. Failures after this call has returned are delivered
    /// as [`HotplugEvent::Error`] through the observer instead. Identity
    /// events not matching `filter` are dropped silently; `Error` events
    /// are always delivered. No deduplication: every transport
    /// notification matching the filter reaches the observer, in
    /// observation order.
    pub fn start<O>(&self, filter: DeviceIdentity, observer: O) -> Result<()>
    where
        O: HotplugObserver + 'static,
    {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(EngineError::AlreadyMonitoring);
        }

        let (events_tx, events_rx) = async_channel::unbounded();
        let subscription = self
            .transport
            .subscribe_hotplug(events_tx)
            .map_err(EngineError::Subscription)?;

        let observer: Box<dyn HotplugObserver> = Box::new(observer);
        let pump = thread::Builder::new()
            .name("hotplug-pump".to_string())
            .spawn(move || pump_events(events_rx, filter, observer))
            .expect("Failed to spawn hotplug pump thread");

        debug!("Hotplug monitor started with filter {filter}");
        *active = Some(ActiveMonitor { subscription, pump });
        Ok(())
    }

    /// Stops monitoring and releases the observer.
    ///
    /// Returns `false` when the monitor was not active. Dropping the
    /// subscription closes the event channel, so the pump drains whatever
    /// was already queued and exits; by the time this returns the
    /// observer has been dropped. The wait is bounded by the transport's
    /// unsubscribe, never by transfer activity.
    pub fn stop(&self) -> bool {
        let taken = self.active.lock().unwrap().take();
        let Some(ActiveMonitor { subscription, pump }) = taken else {
            return false;
        };

        drop(subscription);
        if pump.join().is_err() {
            warn!("Hotplug pump thread panicked");
        }
        debug!("Hotplug monitor stopped");
        true
    }

    /// Whether the monitor is currently delivering events.
    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }
}

fn pump_events(
    events: Receiver<HotplugEvent>,
    filter: DeviceIdentity,
    mut observer: Box<dyn HotplugObserver>,
) {
    while let Ok(event) = events.recv_blocking() {
        if let Some(identity) = event.identity()
            && !filter.matches(identity)
        {
            trace!("Dropping hotplug event for non-matching {identity}");
            continue;
        }
        if let HotplugEvent::Error { message } = &event {
            warn!("Hotplug subscription reported: {message}");
        }
        observer.on_event(event);
    }
    trace!("Hotplug pump drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use std::sync::mpsc;
    use std::time::Duration;

    const HWJ: DeviceIdentity = DeviceIdentity {
        vendor_id: 0x0483,
        product_id: 0x5750,
    };
    const GNS: DeviceIdentity = DeviceIdentity {
        vendor_id: 0x0483,
        product_id: 0x5448,
    };
    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    /// Observer that forwards into an mpsc channel for assertions.
    fn collector() -> (impl FnMut(HotplugEvent) + Send, mpsc::Receiver<HotplugEvent>) {
        let (tx, rx) = mpsc::channel();
        (
            move |event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    #[test]
    fn start_twice_fails_with_already_monitoring() {
        let transport = MockTransport::new();
        let monitor = HotplugMonitor::new(transport);
        let (observer, _rx) = collector();

        monitor.start(DeviceIdentity::ANY, observer).expect("start");
        let (second, _rx2) = collector();
        assert_eq!(
            monitor.start(DeviceIdentity::ANY, second),
            Err(EngineError::AlreadyMonitoring)
        );
        assert!(monitor.is_active());
        assert!(monitor.stop());
    }

    #[test]
    fn stop_without_start_returns_false() {
        let monitor = HotplugMonitor::new(MockTransport::new());
        assert!(!monitor.stop());
        assert!(!monitor.is_active());
    }

    #[test]
    fn stop_then_start_again_works() {
        let transport = MockTransport::new();
        let monitor = HotplugMonitor::new(transport.clone());

        let (observer, _rx) = collector();
        monitor.start(DeviceIdentity::ANY, observer).expect("start");
        assert!(monitor.stop());
        assert!(!monitor.is_active());

        let (observer, rx) = collector();
        monitor.start(HWJ, observer).expect("restart");
        transport.emit(HotplugEvent::Arrival { identity: HWJ });
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT),
            Ok(HotplugEvent::Arrival { identity: HWJ })
        );
        assert!(monitor.stop());
    }

    #[test]
    fn non_matching_identities_are_dropped_silently() {
        let transport = MockTransport::new();
        let monitor = HotplugMonitor::new(transport.clone());
        let (observer, rx) = collector();
        monitor
            .start(DeviceIdentity::new(0x0483, 0), observer)
            .expect("start");

        transport.emit(HotplugEvent::Arrival {
            identity: DeviceIdentity::new(0x1234, 0x5678),
        });
        transport.emit(HotplugEvent::Arrival { identity: HWJ });

        // Only the vendor match arrives; the foreign device never does.
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT),
            Ok(HotplugEvent::Arrival { identity: HWJ })
        );
        assert!(rx.try_recv().is_err());
        assert!(monitor.stop());
    }

    #[test]
    fn wildcard_vendor_filter_delivers_one_event_per_notification() {
        let transport = MockTransport::new();
        let monitor = HotplugMonitor::new(transport.clone());
        let (observer, rx) = collector();
        monitor
            .start(DeviceIdentity::new(0x0483, 0), observer)
            .expect("start");

        transport.emit(HotplugEvent::Arrival { identity: HWJ });

        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT),
            Ok(HotplugEvent::Arrival { identity: HWJ })
        );
        // Exactly once: nothing else was observed, nothing is duplicated.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(monitor.stop());
    }

    #[test]
    fn events_arrive_in_observation_order() {
        let transport = MockTransport::new();
        let monitor = HotplugMonitor::new(transport.clone());
        let (observer, rx) = collector();
        monitor.start(DeviceIdentity::ANY, observer).expect("start");

        transport.emit(HotplugEvent::Arrival { identity: HWJ });
        transport.emit(HotplugEvent::Arrival { identity: GNS });
        transport.emit(HotplugEvent::Removal { identity: HWJ });

        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT),
            Ok(HotplugEvent::Arrival { identity: HWJ })
        );
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT),
            Ok(HotplugEvent::Arrival { identity: GNS })
        );
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT),
            Ok(HotplugEvent::Removal { identity: HWJ })
        );
        assert!(monitor.stop());
    }

    #[test]
    fn error_events_bypass_the_filter() {
        let transport = MockTransport::new();
        let monitor = HotplugMonitor::new(transport.clone());
        let (observer, rx) = collector();
        // Filter that matches nothing real.
        monitor
            .start(DeviceIdentity::new(0xffff, 0xffff), observer)
            .expect("start");

        transport.emit(HotplugEvent::Error {
            message: "event pump failed".to_string(),
        });

        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT),
            Ok(HotplugEvent::Error {
                message: "event pump failed".to_string()
            })
        );
        assert!(monitor.stop());
    }

    #[test]
    fn subscribe_failure_surfaces_from_start() {
        let transport = MockTransport::new();
        transport.fail_subscribe(crate::error::TransportError::Access);
        let monitor = HotplugMonitor::new(transport);
        let (observer, _rx) = collector();

        assert_eq!(
            monitor.start(DeviceIdentity::ANY, observer),
            Err(EngineError::Subscription(
                crate::error::TransportError::Access
            ))
        );
        assert!(!monitor.is_active());
    }

    #[test]
    fn stop_releases_the_observer() {
        let transport = MockTransport::new();
        let monitor = HotplugMonitor::new(transport.clone());
        let (observer, rx) = collector();
        monitor.start(DeviceIdentity::ANY, observer).expect("start");

        assert!(monitor.stop());
        assert!(!transport.has_subscriber());
        // The observer (and its channel sender) died with the pump.
        assert_eq!(rx.recv(), Err(mpsc::RecvError));
    }
}
