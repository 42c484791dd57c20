//! Application-level liveness for the data channel.
//!
//! ICE's own state can lag real reachability loss, so the offerer probes the
//! channel with PING frames and forces an ICE restart when pongs stop coming
//! back. The answerer keeps no state at all; it only answers pings.
//!
//! PING and PONG share the byte channel with game traffic and are told apart
//! by exact length-and-content equality, trailing NUL included. The literals
//! are 15 bytes so they match peers that compare by `sizeof`.

use std::time::{Duration, Instant};

/// Liveness probe frame. 15 bytes, trailing NUL included.
pub const PING: &[u8; 15] = b"ICEADAPTERPING\0";
/// Liveness reply frame. 15 bytes, trailing NUL included.
pub const PONG: &[u8; 15] = b"ICEADAPTERPONG\0";

/// Default interval between connection checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// A stale pong older than this (relative to the last sent ping) forces a
/// restart even though pongs are still trickling in.
const NO_PONG_RESTART_AFTER: Duration = Duration::from_secs(15);

/// Consecutive check intervals without any pong before forcing a restart.
const MISSED_PINGS_RESTART: u32 = 2;

/// Keepalive frame classification for inbound channel messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Pong,
}

/// Classify an inbound data-channel message. `None` means game traffic.
pub fn classify(payload: &[u8]) -> Option<Frame> {
    if payload == PING {
        Some(Frame::Ping)
    } else if payload == PONG {
        Some(Frame::Pong)
    } else {
        None
    }
}

/// What the relay must do after a liveness tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Not connected: trigger offer creation, send nothing.
    Restart,
    /// Connected: send a ping, preceded by offer creation when `restart`.
    Ping { restart: bool },
}

/// Offerer-side keepalive bookkeeping.
///
/// The monitor never does I/O. The relay calls [`tick`] when the deadline
/// fires, performs the returned action, and reports the actual ping send via
/// [`record_ping_sent`] (a ping that could not be sent is not recorded).
///
/// [`tick`]: LivenessMonitor::tick
/// [`record_ping_sent`]: LivenessMonitor::record_ping_sent
#[derive(Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    deadline: Option<Instant>,
    last_sent_ping: Option<Instant>,
    last_received_pong: Option<Instant>,
    missed_pings: u32,
}

impl LivenessMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            last_sent_ping: None,
            last_received_pong: None,
            missed_pings: 0,
        }
    }

    /// Next instant the relay should call [`LivenessMonitor::tick`].
    /// `None` until scheduled (answerers never schedule).
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Rearm to a full interval. Called on every offer creation so a restart
    /// gets a whole check interval of grace, and by [`LivenessMonitor::tick`]
    /// itself.
    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Clear all bookkeeping. Called on every false→true transition of
    /// `connected`.
    pub fn reset(&mut self) {
        self.missed_pings = 0;
        self.last_sent_ping = None;
        self.last_received_pong = None;
    }

    pub fn record_ping_sent(&mut self, now: Instant) {
        self.last_sent_ping = Some(now);
        self.last_received_pong = None;
    }

    pub fn record_pong(&mut self, now: Instant) {
        self.last_received_pong = Some(now);
    }

    /// Evaluate one connection check.
    pub fn tick(&mut self, connected: bool, now: Instant) -> TickAction {
        self.schedule(now);

        if !connected {
            return TickAction::Restart;
        }

        let mut restart = false;
        if let Some(sent) = self.last_sent_ping {
            match self.last_received_pong {
                None => {
                    self.missed_pings += 1;
                    if self.missed_pings == MISSED_PINGS_RESTART {
                        restart = true;
                    }
                }
                Some(pong) => {
                    // A pong arrived, but it answers an older ping.
                    if sent > pong && sent - pong >= NO_PONG_RESTART_AFTER {
                        restart = true;
                    }
                }
            }
        }

        TickAction::Ping { restart }
    }

    #[cfg(test)]
    pub(crate) fn missed_pings(&self) -> u32 {
        self.missed_pings
    }

    #[cfg(test)]
    pub(crate) fn last_sent(&self) -> Option<Instant> {
        self.last_sent_ping
    }

    #[cfg(test)]
    pub(crate) fn last_pong(&self) -> Option<Instant> {
        self.last_received_pong
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn monitor() -> (LivenessMonitor, Instant) {
        let now = Instant::now();
        let mut m = LivenessMonitor::new(INTERVAL);
        m.schedule(now);
        (m, now)
    }

    #[test]
    fn frames_are_fifteen_bytes_with_trailing_nul() {
        assert_eq!(PING.len(), 15);
        assert_eq!(PONG.len(), 15);
        assert_eq!(PING[14], 0);
        assert_eq!(PONG[14], 0);
    }

    #[test]
    fn classify_requires_exact_match() {
        assert_eq!(classify(PING), Some(Frame::Ping));
        assert_eq!(classify(PONG), Some(Frame::Pong));
        // Without the NUL it is game traffic.
        assert_eq!(classify(b"ICEADAPTERPING"), None);
        assert_eq!(classify(b"ICEADAPTERPING\0x"), None);
        assert_eq!(classify(&[0x01, 0x02, 0x03, 0x04]), None);
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn tick_while_disconnected_restarts_without_pinging() {
        let (mut m, now) = monitor();
        assert_eq!(m.tick(false, now), TickAction::Restart);
        // Deadline rearmed a full interval out.
        assert_eq!(m.deadline(), Some(now + INTERVAL));
    }

    #[test]
    fn second_unanswered_interval_forces_restart() {
        let (mut m, t0) = monitor();

        // First tick: nothing in flight yet, just ping.
        assert_eq!(m.tick(true, t0), TickAction::Ping { restart: false });
        m.record_ping_sent(t0);

        let t1 = t0 + INTERVAL;
        assert_eq!(m.tick(true, t1), TickAction::Ping { restart: false });
        assert_eq!(m.missed_pings(), 1);
        m.record_ping_sent(t1);

        let t2 = t1 + INTERVAL;
        assert_eq!(m.tick(true, t2), TickAction::Ping { restart: true });
        assert_eq!(m.missed_pings(), 2);
    }

    #[test]
    fn pong_within_interval_keeps_the_session_alive() {
        let (mut m, t0) = monitor();

        m.tick(true, t0);
        m.record_ping_sent(t0);
        m.record_pong(t0 + Duration::from_millis(40));

        let t1 = t0 + INTERVAL;
        assert_eq!(m.tick(true, t1), TickAction::Ping { restart: false });
        assert_eq!(m.missed_pings(), 0);
    }

    #[test]
    fn stale_pong_past_threshold_forces_restart() {
        let (mut m, t0) = monitor();

        m.tick(true, t0);
        m.record_ping_sent(t0);

        // A pong for an old ping arrives, then a fresh ping goes out 15s
        // after that pong.
        m.record_pong(t0 + Duration::from_secs(1));
        let sent = t0 + Duration::from_secs(16);
        m.last_sent_ping = Some(sent);

        assert_eq!(
            m.tick(true, sent + Duration::from_secs(1)),
            TickAction::Ping { restart: true }
        );
    }

    #[test]
    fn reset_clears_bookkeeping_on_connect() {
        let (mut m, t0) = monitor();
        m.tick(true, t0);
        m.record_ping_sent(t0);
        m.tick(true, t0 + INTERVAL);
        assert_eq!(m.missed_pings(), 1);

        m.reset();
        assert_eq!(m.missed_pings(), 0);
        assert!(m.last_sent_ping.is_none());
        assert!(m.last_received_pong.is_none());
    }

    #[test]
    fn stop_clears_the_deadline() {
        let (mut m, _) = monitor();
        assert!(m.deadline().is_some());
        m.stop();
        assert!(m.deadline().is_none());
    }
}
