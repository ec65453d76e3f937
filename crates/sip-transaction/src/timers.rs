//! Transport-aware timer values per RFC 3261 §17 and Table 4.
//!
//! Unreliable transports (UDP) use the full timer set; reliable transports
//! (TCP/TLS, and the WebSocket family which rides on them) zero the
//! retransmission and absorb timers:
//!
//! - Timer A/E/G (retransmit): 0 when reliable
//! - Timer B/F/H (timeout): 64·T1 always
//! - Timer D: 32 s UDP, 0 reliable
//! - Timer I/K: T4 UDP, 0 reliable
//! - Timer J: 64·T1 UDP, 0 reliable

use std::time::Duration;

use crate::TransactionTimer;

/// Transport protocol for timer calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Transport {
    /// Everything except UDP delivers reliably.
    pub fn is_reliable(self) -> bool {
        !matches!(self, Transport::Udp)
    }
}

/// RFC 3261 base timer values (Table 4).
///
/// T1 is the RTT estimate and MUST NOT be configured below 500 ms on the
/// open internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate, default 500 ms.
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE, default 4 s.
    pub t2: Duration,
    /// Maximum duration a message stays in the network, default 5 s.
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer value calculator bound to one transaction's transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: Transport,
    defaults: TimerDefaults,
}

impl TransportAwareTimers {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            defaults: TimerDefaults::default(),
        }
    }

    pub fn with_defaults(transport: Transport, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    pub fn t1(&self) -> Duration {
        self.defaults.t1
    }

    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    /// Returns the appropriate duration for a given timer on this transport.
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                if reliable {
                    Duration::ZERO
                } else {
                    self.defaults.t1
                }
            }
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                self.defaults.t1.saturating_mul(64)
            }
            TransactionTimer::D => {
                if reliable {
                    Duration::ZERO
                } else {
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
                    self.defaults.t1.saturating_mul(64)
                }
            }
        }
    }

    /// Retransmissions only make sense on unreliable transports.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_timers_zero_for_reliable() {
        for transport in [Transport::Tcp, Transport::Tls, Transport::Ws, Transport::Wss] {
            let timers = TransportAwareTimers::new(transport);
            assert_eq!(timers.duration(TransactionTimer::A), Duration::ZERO);
            assert_eq!(timers.duration(TransactionTimer::E), Duration::ZERO);
            assert_eq!(timers.duration(TransactionTimer::G), Duration::ZERO);
            assert!(!timers.should_retransmit());
        }
    }

    #[test]
    fn udp_uses_full_values() {
        let timers = TransportAwareTimers::new(Transport::Udp);
        assert_eq!(timers.duration(TransactionTimer::A), Duration::from_millis(500));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_secs(5));
        assert_eq!(timers.duration(TransactionTimer::D), Duration::from_secs(32));
        assert_eq!(timers.duration(TransactionTimer::J), Duration::from_secs(32));
        assert!(timers.should_retransmit());
    }

    #[test]
    fn timeout_timers_are_64_t1_everywhere() {
        let udp = TransportAwareTimers::new(Transport::Udp);
        let tcp = TransportAwareTimers::new(Transport::Tcp);
        for timer in [TransactionTimer::B, TransactionTimer::F, TransactionTimer::H] {
            assert_eq!(udp.duration(timer), Duration::from_secs(32));
            assert_eq!(tcp.duration(timer), Duration::from_secs(32));
        }
    }

    #[test]
    fn custom_defaults_scale_timeouts() {
        let custom = TimerDefaults {
            t1: Duration::from_millis(20),
            t2: Duration::from_millis(160),
            t4: Duration::from_millis(200),
        };
        let timers = TransportAwareTimers::with_defaults(Transport::Udp, custom);
        assert_eq!(timers.duration(TransactionTimer::F), Duration::from_millis(1280));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_millis(200));
    }
}
