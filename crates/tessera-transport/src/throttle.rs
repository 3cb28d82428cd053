//! # Send Throttler
//!
//! Server-side token bucket limiting the instantaneous send rate to the
//! burst bitrate the client requested. Senders call
//! [`NetworkThrottler::wait_byte_allocation`] before each datagram and block
//! until the bucket holds enough bytes.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use quanta::Instant;

use crate::crypto::MAX_DATAGRAM_SIZE;

/// Bucket depth expressed as time at the configured rate.
const BURST_WINDOW: Duration = Duration::from_millis(10);

struct TokenBucket {
    /// Bytes per second.
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(bitrate: u32) -> Self {
        let mut bucket = TokenBucket {
            rate: 0.0,
            capacity: 0.0,
            tokens: 0.0,
            last_refill: Instant::now(),
        };
        bucket.set_rate(bitrate);
        bucket.tokens = bucket.capacity;
        bucket
    }

    fn set_rate(&mut self, bitrate: u32) {
        self.refill();
        self.rate = bitrate.max(1) as f64 / 8.0;
        self.capacity = (self.rate * BURST_WINDOW.as_secs_f64()).max(MAX_DATAGRAM_SIZE as f64);
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume `bytes` if available, otherwise return how long to wait.
    fn try_consume(&mut self, bytes: f64) -> Option<Duration> {
        self.refill();
        if self.tokens >= bytes {
            self.tokens -= bytes;
            None
        } else {
            Some(Duration::from_secs_f64((bytes - self.tokens) / self.rate))
        }
    }
}

pub struct NetworkThrottler {
    bucket: Mutex<TokenBucket>,
}

impl NetworkThrottler {
    pub fn new(burst_bitrate: u32) -> Self {
        NetworkThrottler {
            bucket: Mutex::new(TokenBucket::new(burst_bitrate)),
        }
    }

    pub fn set_burst_bitrate(&self, burst_bitrate: u32) {
        self.lock().set_rate(burst_bitrate);
        tracing::debug!(burst_bitrate, "throttler rate updated");
    }

    pub fn burst_bitrate(&self) -> u32 {
        (self.lock().rate * 8.0) as u32
    }

    /// Block until `bytes` may be sent at the current rate.
    pub fn wait_byte_allocation(&self, bytes: usize) {
        loop {
            let wait = {
                let mut bucket = self.lock();
                let bytes = (bytes as f64).min(bucket.capacity);
                bucket.try_consume(bytes)
            };
            match wait {
                None => return,
                Some(d) => thread::sleep(d),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }
}
