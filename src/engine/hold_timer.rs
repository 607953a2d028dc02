use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, Interval};

/// What the hold timer wants the session to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HoldAction {
    SendKeepalive,
    Expired,
}

/// Tracks the negotiated hold time for one session.
///
/// Keepalives are due once less than 2/3 of the hold time remains since
/// the last send, which keeps the effective keepalive cadence at 1/3 of
/// the hold time. A peer that stays silent for the full hold time expires
/// the session.
#[derive(Debug)]
pub(crate) struct HoldTimer {
    pub(crate) hold_time: u16,
    keepalive_interval: u16,
    timer: Interval,
    last_sent: DateTime<Utc>,
    last_received: DateTime<Utc>,
}

impl HoldTimer {
    pub(crate) fn new(hold_time: u16) -> HoldTimer {
        HoldTimer {
            hold_time,
            keepalive_interval: hold_time / 3,
            timer: interval(Duration::from_millis(100)),
            last_sent: Utc::now(),
            last_received: Utc::now(),
        }
    }

    /// Note an outgoing message.
    pub(crate) fn sent(&mut self) {
        self.last_sent = Utc::now();
    }

    /// Note an incoming message.
    pub(crate) fn received(&mut self) {
        self.last_received = Utc::now();
    }

    /// Resolve once a keepalive is due or the peer's hold time expired.
    /// Never resolves for a zero hold time (keepalives disabled).
    pub(crate) async fn poll(&mut self) -> HoldAction {
        if self.hold_time == 0 {
            std::future::pending::<()>().await;
        }
        loop {
            self.timer.tick().await;
            if self.is_expired() {
                return HoldAction::Expired;
            }
            if self.remaining().num_seconds() < 2 * i64::from(self.keepalive_interval) {
                return HoldAction::SendKeepalive;
            }
        }
    }

    // Hold time left, counting down from the last send; never negative.
    fn remaining(&self) -> chrono::Duration {
        let hold_time = chrono::Duration::seconds(self.hold_time.into());
        let elapsed = Utc::now() - self.last_sent;
        if elapsed > hold_time {
            chrono::Duration::seconds(0)
        } else {
            hold_time - elapsed
        }
    }

    fn is_expired(&self) -> bool {
        let hold_time = chrono::Duration::seconds(self.hold_time.into());
        Utc::now() - self.last_received >= hold_time
    }
}

impl fmt::Display for HoldTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.remaining().num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_keepalive_due_after_a_third() {
        let mut timer = HoldTimer::new(30);
        assert_eq!(timer.keepalive_interval, 10);
        assert!(!timer.is_expired());

        // Fresh timer: nothing due, poll must not resolve quickly.
        timer.timer = interval(Duration::from_millis(1));
        assert!(timeout(Duration::from_millis(20), timer.poll())
            .await
            .is_err());

        // 10 of 30 seconds gone since the last send: keepalive due.
        timer.last_sent = Utc::now() - chrono::Duration::seconds(10);
        timer.timer = interval(Duration::from_millis(1));
        let action = timeout(Duration::from_millis(100), timer.poll())
            .await
            .unwrap();
        assert_eq!(action, HoldAction::SendKeepalive);

        timer.sent();
        timer.timer = interval(Duration::from_millis(1));
        assert!(timeout(Duration::from_millis(20), timer.poll())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_expires_after_silence() {
        let mut timer = HoldTimer::new(30);
        timer.last_received = Utc::now() - chrono::Duration::seconds(30);
        timer.timer = interval(Duration::from_millis(1));
        let action = timeout(Duration::from_millis(100), timer.poll())
            .await
            .unwrap();
        assert_eq!(action, HoldAction::Expired);
    }

    #[tokio::test]
    async fn test_zero_hold_time_never_fires() {
        let mut timer = HoldTimer::new(0);
        assert!(timeout(Duration::from_millis(20), timer.poll())
            .await
            .is_err());
    }
}
