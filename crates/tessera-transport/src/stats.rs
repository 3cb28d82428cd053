//! # Transport Statistics
//!
//! Socket-level counters (lock-free, updated from any thread) and the
//! per-period window the receiver loop turns into [`NetworkStatistics`]
//! for the bitrate controller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

use crate::bitrate::NetworkStatistics;

// ─── Socket Stats ────────────────────────────────────────────────────────────

/// Snapshot of one socket context's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SocketStats {
    /// Datagrams handed to the OS (including retransmissions).
    pub packets_sent: u64,
    /// Sealed bytes handed to the OS.
    pub bytes_sent: u64,
    /// Fragments resent in answer to a NACK.
    pub retransmissions: u64,
    /// NACKs for fragments no longer buffered.
    pub nacks_not_found: u64,
    /// Datagrams the OS refused after all retries.
    pub send_failures: u64,
    /// Datagrams decoded into packets.
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Datagrams that failed to open or decode.
    pub decrypt_failures: u64,
    /// Reads that returned without data.
    pub read_timeouts: u64,
}

#[derive(Default)]
pub(crate) struct SocketCounters {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub retransmissions: AtomicU64,
    pub nacks_not_found: AtomicU64,
    pub send_failures: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub read_timeouts: AtomicU64,
}

impl SocketCounters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SocketStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SocketStats {
            packets_sent: get(&self.packets_sent),
            bytes_sent: get(&self.bytes_sent),
            retransmissions: get(&self.retransmissions),
            nacks_not_found: get(&self.nacks_not_found),
            send_failures: get(&self.send_failures),
            packets_received: get(&self.packets_received),
            bytes_received: get(&self.bytes_received),
            decrypt_failures: get(&self.decrypt_failures),
            read_timeouts: get(&self.read_timeouts),
        }
    }
}

// ─── Statistics Window ───────────────────────────────────────────────────────

/// Counts events over one measurement period.
pub struct StatisticsWindow {
    period: Duration,
    started: Instant,
    received_packets: u64,
    received_bytes: u64,
    nacks: u64,
    rendered_frames: u64,
    skipped_frames: u64,
}

impl StatisticsWindow {
    pub fn new(period: Duration) -> Self {
        StatisticsWindow {
            period,
            started: Instant::now(),
            received_packets: 0,
            received_bytes: 0,
            nacks: 0,
            rendered_frames: 0,
            skipped_frames: 0,
        }
    }

    pub fn record_packet(&mut self, payload_bytes: usize) {
        self.received_packets += 1;
        self.received_bytes += payload_bytes as u64;
    }

    pub fn record_nacks(&mut self, count: usize) {
        self.nacks += count as u64;
    }

    pub fn record_rendered(&mut self) {
        self.rendered_frames += 1;
    }

    pub fn record_skipped(&mut self, count: u64) {
        self.skipped_frames += count;
    }

    /// Close the window if a full period has elapsed, returning the counts
    /// normalised to one second.
    pub fn take(&mut self, now: Instant) -> Option<NetworkStatistics> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.period || elapsed.is_zero() {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        let per_sec = |v: u64| (v as f64 / secs).round() as u32;
        let stats = NetworkStatistics {
            num_nacks_per_second: per_sec(self.nacks),
            num_received_packets_per_second: per_sec(self.received_packets),
            num_skipped_frames_per_second: per_sec(self.skipped_frames),
            num_rendered_frames_per_second: per_sec(self.rendered_frames),
            throughput_per_second: (self.received_bytes as f64 * 8.0 / secs) as u64,
            statistics_gathered: true,
        };
        *self = StatisticsWindow::new(self.period);
        self.started = now;
        Some(stats)
    }
}
