//! Keepalive monitor.
//!
//! Every interval the monitor sends a transport-level ping and an
//! application-level `ping` frame, then arms a watchdog. Any pong cancels
//! the armed watchdog. If the watchdog fires first, the session is forced
//! closed and reconnection takes over.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, trace, warn};

/// Phase of the current keepalive interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepalivePhase {
    Idle,
    PingSent,
    Acked,
    WatchdogExpired,
}

/// The single watchdog of a connection.
///
/// Arming replaces the previous watchdog. A replacement armed while a ping
/// is still unanswered keeps the outstanding deadline, so a later ping can
/// never extend the life of an unanswered one.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Option<Instant>,
    phase: KeepalivePhase,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
            phase: KeepalivePhase::Idle,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.timeout);
        }
        self.phase = KeepalivePhase::PingSent;
    }

    /// Cancel the armed watchdog. Returns `false` if none was armed.
    pub fn acknowledge(&mut self) -> bool {
        if self.deadline.take().is_some() {
            self.phase = KeepalivePhase::Acked;
            true
        } else {
            false
        }
    }

    pub fn expire(&mut self) {
        self.deadline = None;
        self.phase = KeepalivePhase::WatchdogExpired;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn phase(&self) -> KeepalivePhase {
        self.phase
    }
}

/// What the monitor needs from the connection it watches.
pub(crate) trait KeepaliveHost: Send + 'static {
    /// Send both pings. Returns `false` once the connection is gone.
    fn send_ping(&self) -> bool;

    /// Called once when the watchdog fires.
    fn watchdog_expired(&self);
}

/// Wakes the monitor when any pong arrives.
#[derive(Debug, Clone, Default)]
pub struct PongSignal {
    notify: Arc<Notify>,
}

impl PongSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pong(&self) {
        // A stored permit covers a pong that lands while the monitor is busy.
        self.notify.notify_one();
    }

    async fn received(&self) {
        self.notify.notified().await
    }
}

/// Run the monitor until the connection goes away or the watchdog fires.
pub(crate) async fn run<H: KeepaliveHost>(
    host: H,
    pongs: PongSignal,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watchdog = Watchdog::new(timeout);

    debug!(
        interval_ms = interval.as_millis() as u64,
        timeout_ms = timeout.as_millis() as u64,
        "Keepalive monitor started"
    );

    loop {
        let deadline = watchdog.deadline();
        tokio::select! {
            _ = ticker.tick() => {
                if !host.send_ping() {
                    debug!("Keepalive monitor stopped, connection gone");
                    return;
                }
                watchdog.arm(Instant::now());
                trace!(phase = ?watchdog.phase(), "Ping sent");
            }
            _ = pongs.received() => {
                if watchdog.acknowledge() {
                    trace!("Pong received, watchdog cancelled");
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                watchdog.expire();
                warn!(timeout_ms = timeout.as_millis() as u64, "No pong before watchdog expired");
                host.watchdog_expired();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        pings: Arc<Mutex<u32>>,
        expired: Arc<Mutex<u32>>,
    }

    impl KeepaliveHost for Recorder {
        fn send_ping(&self) -> bool {
            *self.pings.lock() += 1;
            true
        }

        fn watchdog_expired(&self) {
            *self.expired.lock() += 1;
        }
    }

    #[test]
    fn test_watchdog_phases() {
        let now = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_secs(35));
        assert_eq!(watchdog.phase(), KeepalivePhase::Idle);
        assert!(!watchdog.acknowledge());

        watchdog.arm(now);
        assert_eq!(watchdog.phase(), KeepalivePhase::PingSent);
        assert_eq!(watchdog.deadline(), Some(now + Duration::from_secs(35)));

        assert!(watchdog.acknowledge());
        assert_eq!(watchdog.phase(), KeepalivePhase::Acked);
        assert!(watchdog.deadline().is_none());
    }

    #[test]
    fn test_rearm_keeps_outstanding_deadline() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_secs(35));

        watchdog.arm(start);
        watchdog.arm(start + Duration::from_secs(30));
        assert_eq!(watchdog.deadline(), Some(start + Duration::from_secs(35)));

        // A late pong for the first ping still cancels the current watchdog.
        assert!(watchdog.acknowledge());
        watchdog.arm(start + Duration::from_secs(60));
        assert_eq!(watchdog.deadline(), Some(start + Duration::from_secs(95)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_once_without_pong() {
        let host = Recorder::default();
        let started = Instant::now();

        run(
            host.clone(),
            PongSignal::new(),
            Duration::from_secs(30),
            Duration::from_secs(35),
        )
        .await;

        assert_eq!(*host.expired.lock(), 1);
        // Pinged at 30s and 60s; watchdog from the 30s ping fires at 65s.
        assert_eq!(*host.pings.lock(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(65) && elapsed < Duration::from_secs(66));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_monitor_alive() {
        let host = Recorder::default();
        let pongs = PongSignal::new();

        let task = tokio::spawn(run(
            host.clone(),
            pongs.clone(),
            Duration::from_secs(30),
            Duration::from_secs(35),
        ));

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(31)).await;
            pongs.pong();
        }

        assert_eq!(*host.expired.lock(), 0);
        assert!(!task.is_finished());
        task.abort();
    }
}
