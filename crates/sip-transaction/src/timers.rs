// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer calculations per RFC 3261 §17.
//!
//! Timer values depend on whether the transaction runs over a reliable
//! transport:
//! - **Unreliable (UDP)**: retransmission timers A, E and G run, and the
//!   wait timers D, I, J and K hold the transaction open to absorb copies.
//! - **Reliable (TCP/TLS)**: no retransmissions; D, I, J and K are zero so
//!   the transaction terminates as soon as it completes.
//!
//! Timeouts B, F and H are 64*T1 on every transport.
//!
//! ```rust
//! use sip_transaction::timers::TransportAwareTimers;
//! use sip_transaction::{TransactionTimer, TransportKind};
//! use std::time::Duration;
//!
//! let timers = TransportAwareTimers::new(TransportKind::Tcp);
//! assert_eq!(timers.duration(TransactionTimer::K), Duration::ZERO);
//! assert_eq!(timers.duration(TransactionTimer::F), Duration::from_secs(32));
//! assert!(!timers.should_retransmit());
//! ```

use std::time::Duration;

use crate::{TransactionTimer, TransportKind};

/// Default delay before an INVITE server transaction answers 100 Trying on its own.
pub const TRYING_DELAY: Duration = Duration::from_millis(200);

/// RFC 3261 base timer values (Table 4) plus the linger grace period.
///
/// T1 MUST NOT be set lower than 500ms on the public Internet; tests may
/// shrink it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate - default 500ms
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE - default 4s
    pub t2: Duration,
    /// Maximum wait time for network to clear - default 5s
    pub t4: Duration,
    /// How long an INVITE transaction answered by a 2xx stays in the table.
    /// Defaults to 2*T1.
    pub linger: Duration,
    /// Delay before an INVITE server transaction sends its own 100 Trying.
    pub trying: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self::with_base(
            Duration::from_millis(500),
            Duration::from_secs(4),
            Duration::from_secs(5),
        )
    }
}

impl TimerDefaults {
    /// Builds defaults from T1/T2/T4 with the linger period derived from T1.
    pub fn with_base(t1: Duration, t2: Duration, t4: Duration) -> Self {
        Self {
            t1,
            t2,
            t4,
            linger: t1.saturating_mul(2),
            trying: TRYING_DELAY,
        }
    }
}

/// Transport-aware timer value calculator.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: TransportKind,
    defaults: TimerDefaults,
}

impl TransportAwareTimers {
    /// Creates a new timer calculator for the specified transport.
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            defaults: TimerDefaults::default(),
        }
    }

    /// Creates a timer calculator with custom base timer values.
    pub fn with_defaults(transport: TransportKind, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    /// Returns the initial duration for a given timer.
    ///
    /// For the retransmission timers (A, E, G) this is the first interval;
    /// see [`TransportAwareTimers::next_interval`] for the back-off.
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        let t1 = self.defaults.t1;
        match timer {
            TransactionTimer::T1 => t1,
            TransactionTimer::T2 => self.defaults.t2,
            TransactionTimer::T4 => self.defaults.t4,

            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                if reliable {
                    Duration::ZERO
                } else {
                    t1
                }
            }
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                t1.saturating_mul(64)
            }
            TransactionTimer::D => {
                if reliable {
                    Duration::ZERO
                } else {
                    // RFC 3261 fixes Timer D at "> 32s" rather than deriving it from T1.
                    Duration::from_secs(32)
                }
            }
            TransactionTimer::I | TransactionTimer::K => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t4
                }
            }
            TransactionTimer::J => {
                if reliable {
                    Duration::ZERO
                } else {
                    t1.saturating_mul(64)
                }
            }
            TransactionTimer::Trying => self.defaults.trying,
            TransactionTimer::Linger => self.defaults.linger,
        }
    }

    /// Returns the interval following `current` for a retransmission timer.
    ///
    /// Timer A doubles without a cap (Timer B bounds it); E and G double up
    /// to T2.
    pub fn next_interval(&self, timer: TransactionTimer, current: Duration) -> Duration {
        let doubled = current.saturating_mul(2);
        match timer {
            TransactionTimer::A => doubled,
            _ => doubled.min(self.defaults.t2),
        }
    }

    /// Returns whether retransmissions are performed for this transport.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn defaults(&self) -> &TimerDefaults {
        &self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timers_collapse_on_reliable_transports() {
        for transport in [TransportKind::Tcp, TransportKind::Tls] {
            let timers = TransportAwareTimers::new(transport);
            for timer in [
                TransactionTimer::D,
                TransactionTimer::I,
                TransactionTimer::J,
                TransactionTimer::K,
            ] {
                assert_eq!(timers.duration(timer), Duration::ZERO, "{:?}", timer);
            }
        }
    }

    #[test]
    fn udp_wait_timers() {
        let timers = TransportAwareTimers::new(TransportKind::Udp);
        assert_eq!(timers.duration(TransactionTimer::D), Duration::from_secs(32));
        assert_eq!(timers.duration(TransactionTimer::I), Duration::from_secs(5));
        assert_eq!(timers.duration(TransactionTimer::J), Duration::from_secs(32));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_secs(5));
    }

    #[test]
    fn timeouts_same_for_all_transports() {
        for transport in [TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls] {
            let timers = TransportAwareTimers::new(transport);
            for timer in [TransactionTimer::B, TransactionTimer::F, TransactionTimer::H] {
                assert_eq!(timers.duration(timer), Duration::from_secs(32));
            }
        }
    }

    #[test]
    fn timer_a_doubles_without_cap() {
        let timers = TransportAwareTimers::new(TransportKind::Udp);
        let mut interval = timers.duration(TransactionTimer::A);
        let mut seen = vec![interval];
        for _ in 0..5 {
            interval = timers.next_interval(TransactionTimer::A, interval);
            seen.push(interval);
        }
        assert_eq!(
            seen,
            [500, 1000, 2000, 4000, 8000, 16000].map(Duration::from_millis)
        );
    }

    #[test]
    fn timer_e_caps_at_t2() {
        let timers = TransportAwareTimers::new(TransportKind::Udp);
        let mut interval = timers.duration(TransactionTimer::E);
        let mut seen = vec![interval];
        for _ in 0..5 {
            interval = timers.next_interval(TransactionTimer::E, interval);
            seen.push(interval);
        }
        assert_eq!(
            seen,
            [500, 1000, 2000, 4000, 4000, 4000].map(Duration::from_millis)
        );
    }

    #[test]
    fn custom_defaults_scale_derived_timers() {
        let custom = TimerDefaults::with_base(
            Duration::from_secs(1),
            Duration::from_secs(8),
            Duration::from_secs(10),
        );
        let timers = TransportAwareTimers::with_defaults(TransportKind::Udp, custom);

        assert_eq!(timers.duration(TransactionTimer::T1), Duration::from_secs(1));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_secs(10));
        assert_eq!(timers.duration(TransactionTimer::F), Duration::from_secs(64));
        assert_eq!(timers.duration(TransactionTimer::Linger), Duration::from_secs(2));
    }

    #[test]
    fn retransmission_only_for_udp() {
        assert!(TransportAwareTimers::new(TransportKind::Udp).should_retransmit());
        assert!(!TransportAwareTimers::new(TransportKind::Tcp).should_retransmit());
        assert!(!TransportAwareTimers::new(TransportKind::Tls).should_retransmit());
    }
}
