//! # Adaptive Bitrate Controller
//!
//! Turns once-per-second [`NetworkStatistics`] gathered by the receiver into
//! the [`NetworkSettings`] the client asks the server to encode at.
//!
//! The default policy is a ratio EWMA with expectation-streak boosting:
//!
//! - The achieved throughput is estimated as
//!   `expected * received / (received + nacked)`.
//! - When the estimate equals the expectation for `threshold` periods in a
//!   row, the expectation is remembered as the last successful value and
//!   boosted by 5%.
//! - When a boosted expectation loses packets, it falls back to the last
//!   successful value and the streak needed before the next boost doubles
//!   (capped at 1024 periods).
//! - Otherwise losses blend the estimate into the expectation with an EWMA.
//!
//! The burst bitrate follows the same policy with the rendered-frame ratio
//! `rendered / (rendered + skipped)` standing in for the packet ratio.
//!
//! All state lives in [`BitrateController`]; the receiver loop owns one.

use serde::{Deserialize, Serialize};

pub const MINIMUM_BITRATE: u32 = 2_000_000;
pub const MAXIMUM_BITRATE: u32 = 30_000_000;
pub const STARTING_BITRATE: u32 = 15_400_000;
pub const STARTING_BURST_BITRATE: u32 = 100_000_000;

/// Fallback-policy bitrates used while the link is NACKing heavily.
pub const BAD_BITRATE: u32 = 10_400_000;
pub const BAD_BURST_BITRATE: u32 = 31_800_000;

pub const DEFAULT_FPS: u32 = 60;
pub const DEFAULT_FEC_PACKET_RATIO: f64 = 0.0;

const ALPHA: f64 = 0.8;
const BITRATE_THROUGHPUT_RATIO: f64 = 1.25;
const BOOST_MULTIPLIER: f64 = 1.05;
const MEET_EXPECTATIONS_MIN: u32 = 5;
const MEET_EXPECTATIONS_MULTIPLIER: u32 = 2;
const MEET_EXPECTATIONS_MAX: u32 = 1024;
/// NACKs per second above which the fallback policy degrades.
const FALLBACK_NACK_LIMIT: u32 = 6;

// ─── Settings & Statistics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum CodecType {
    Unknown = 0,
    #[default]
    H264 = 264,
    H265 = 265,
}

impl CodecType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            264 => CodecType::H264,
            265 => CodecType::H265,
            _ => CodecType::Unknown,
        }
    }
}

/// Encoder settings requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Average encoder bitrate in bits per second.
    pub bitrate: u32,
    /// Short-term send rate the server throttler allows, bits per second.
    pub burst_bitrate: u32,
    pub fec_packet_ratio: f64,
    pub fps: u32,
    pub desired_codec: CodecType,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            bitrate: STARTING_BITRATE,
            burst_bitrate: STARTING_BURST_BITRATE,
            fec_packet_ratio: DEFAULT_FEC_PACKET_RATIO,
            fps: DEFAULT_FPS,
            desired_codec: CodecType::H264,
        }
    }
}

/// Receiver counters normalised to one second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NetworkStatistics {
    pub num_nacks_per_second: u32,
    pub num_received_packets_per_second: u32,
    pub num_skipped_frames_per_second: u32,
    pub num_rendered_frames_per_second: u32,
    /// Received payload bits per second.
    pub throughput_per_second: u64,
    /// False until a full measurement period has elapsed.
    pub statistics_gathered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitratePolicy {
    /// Ratio EWMA with expectation-streak boosting.
    #[default]
    RatioEwma,
    /// Plain EWMA of measured throughput.
    Ewma,
    /// Two-level switch on the NACK rate.
    Fallback,
}

// ─── Expectation Tracker ─────────────────────────────────────────────────────

/// Streak/boost/fallback state for one adapted quantity.
#[derive(Debug, Clone)]
struct ExpectationTracker {
    expected: i64,
    streak: u32,
    threshold: u32,
    last_successful: Option<i64>,
    last_successful_threshold: u32,
}

impl ExpectationTracker {
    fn new(expected: i64) -> Self {
        ExpectationTracker {
            expected,
            streak: 0,
            threshold: MEET_EXPECTATIONS_MIN,
            last_successful: None,
            last_successful_threshold: MEET_EXPECTATIONS_MIN,
        }
    }

    /// Fold one period's estimate into the expectation.
    fn observe(&mut self, estimate: i64) {
        if estimate == self.expected {
            self.streak += 1;
            if self.streak >= self.threshold {
                self.last_successful = Some(estimate);
                self.streak = 0;
                self.last_successful_threshold = self.threshold;
                self.threshold = MEET_EXPECTATIONS_MIN;
                self.expected = (self.expected as f64 * BOOST_MULTIPLIER) as i64;
            }
            return;
        }

        match self.last_successful {
            Some(good) if self.expected > good => {
                self.expected = good;
                self.last_successful_threshold = (self.last_successful_threshold
                    * MEET_EXPECTATIONS_MULTIPLIER)
                    .min(MEET_EXPECTATIONS_MAX);
                self.threshold = self.last_successful_threshold;
            }
            _ => {
                self.expected = (ALPHA * self.expected as f64 + (1.0 - ALPHA) * estimate as f64) as i64;
                self.threshold = MEET_EXPECTATIONS_MIN;
            }
        }
        self.streak = 0;
    }
}

fn ratio_estimate(expected: i64, good: u32, bad: u32) -> i64 {
    (expected as f64 * good as f64 / (good as f64 + bad as f64)) as i64
}

// ─── Controller ──────────────────────────────────────────────────────────────

pub struct BitrateController {
    policy: BitratePolicy,
    defaults: NetworkSettings,
    current: NetworkSettings,
    /// Expected throughput; bitrate is this times 1.25.
    throughput: ExpectationTracker,
    burst: ExpectationTracker,
    /// Smoothed throughput for the EWMA policy.
    ewma_throughput: f64,
}

impl BitrateController {
    pub fn new(policy: BitratePolicy) -> Self {
        Self::with_defaults(policy, NetworkSettings::default())
    }

    pub fn with_defaults(policy: BitratePolicy, defaults: NetworkSettings) -> Self {
        let starting_throughput = defaults.bitrate as f64 / BITRATE_THROUGHPUT_RATIO;
        BitrateController {
            policy,
            defaults,
            current: defaults,
            throughput: ExpectationTracker::new(starting_throughput as i64),
            burst: ExpectationTracker::new(defaults.burst_bitrate as i64),
            ewma_throughput: starting_throughput,
        }
    }

    pub fn policy(&self) -> BitratePolicy {
        self.policy
    }

    /// Settings produced by the last update.
    pub fn current(&self) -> NetworkSettings {
        self.current
    }

    /// Compute the settings to request for the next period.
    ///
    /// Returns the defaults until statistics have been gathered. fps, FEC
    /// ratio and codec always pass through from the defaults.
    pub fn get_desired_network_settings(&mut self, stats: &NetworkStatistics) -> NetworkSettings {
        if !stats.statistics_gathered {
            return self.defaults;
        }
        match self.policy {
            BitratePolicy::RatioEwma => self.ratio_ewma(stats),
            BitratePolicy::Ewma => self.ewma(stats),
            BitratePolicy::Fallback => self.fallback(stats),
        }
        self.current.fps = self.defaults.fps;
        self.current.fec_packet_ratio = self.defaults.fec_packet_ratio;
        self.current.desired_codec = self.defaults.desired_codec;
        self.current
    }

    fn ratio_ewma(&mut self, stats: &NetworkStatistics) {
        let received = stats.num_received_packets_per_second;
        let nacked = stats.num_nacks_per_second;
        if received as u64 + nacked as u64 > 0 {
            let estimate = ratio_estimate(self.throughput.expected, received, nacked);
            self.throughput.observe(estimate);

            let bitrate = (self.throughput.expected as f64 * BITRATE_THROUGHPUT_RATIO) as i64;
            let clamped = bitrate.clamp(MINIMUM_BITRATE as i64, MAXIMUM_BITRATE as i64);
            if clamped != bitrate {
                self.throughput.expected = (clamped as f64 / BITRATE_THROUGHPUT_RATIO) as i64;
            }
            self.current.bitrate = clamped as u32;
        }

        let rendered = stats.num_rendered_frames_per_second;
        let skipped = stats.num_skipped_frames_per_second;
        if rendered > 0 {
            let estimate = ratio_estimate(self.burst.expected, rendered, skipped);
            self.burst.observe(estimate);
            self.burst.expected = self
                .burst
                .expected
                .clamp(MINIMUM_BITRATE as i64, STARTING_BURST_BITRATE as i64);
            self.current.burst_bitrate = self.burst.expected as u32;
        }
    }

    fn ewma(&mut self, stats: &NetworkStatistics) {
        self.ewma_throughput =
            ALPHA * self.ewma_throughput + (1.0 - ALPHA) * stats.throughput_per_second as f64;
        let bitrate = (BITRATE_THROUGHPUT_RATIO * self.ewma_throughput) as i64;
        self.current.bitrate = bitrate.clamp(MINIMUM_BITRATE as i64, MAXIMUM_BITRATE as i64) as u32;
        self.current.burst_bitrate = self.defaults.burst_bitrate;
    }

    fn fallback(&mut self, stats: &NetworkStatistics) {
        if stats.num_nacks_per_second > FALLBACK_NACK_LIMIT {
            self.current.bitrate = BAD_BITRATE;
            self.current.burst_bitrate = BAD_BURST_BITRATE;
        } else {
            self.current.bitrate = self.defaults.bitrate;
            self.current.burst_bitrate = self.defaults.burst_bitrate;
        }
    }
}

impl Default for BitrateController {
    fn default() -> Self {
        Self::new(BitratePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period(received: u32, nacks: u32) -> NetworkStatistics {
        NetworkStatistics {
            num_nacks_per_second: nacks,
            num_received_packets_per_second: received,
            num_skipped_frames_per_second: 0,
            num_rendered_frames_per_second: 60,
            throughput_per_second: 12_000_000,
            statistics_gathered: true,
        }
    }

    // ─── Defaults ───────────────────────────────────────────────────────

    #[test]
    fn defaults_before_statistics_gathered() {
        let mut ctl = BitrateController::default();
        let stats = NetworkStatistics::default();
        let settings = ctl.get_desired_network_settings(&stats);
        assert_eq!(settings, NetworkSettings::default());
        assert_eq!(settings.bitrate, STARTING_BITRATE);
        assert_eq!(settings.fps, 60);
        assert_eq!(settings.desired_codec, CodecType::H264);
    }

    #[test]
    fn no_packets_keeps_previous_bitrate() {
        let mut ctl = BitrateController::default();
        let mut stats = period(0, 0);
        stats.num_rendered_frames_per_second = 0;
        let settings = ctl.get_desired_network_settings(&stats);
        assert_eq!(settings.bitrate, STARTING_BITRATE);
        assert_eq!(settings.burst_bitrate, STARTING_BURST_BITRATE);
    }

    // ─── Probing ────────────────────────────────────────────────────────

    #[test]
    fn five_clean_periods_boost_exactly_once() {
        let mut ctl = BitrateController::default();
        let mut bitrates = Vec::new();
        for _ in 0..6 {
            bitrates.push(ctl.get_desired_network_settings(&period(100, 0)).bitrate);
        }
        assert!(bitrates[..4].iter().all(|&b| b == STARTING_BITRATE), "{bitrates:?}");
        assert!(bitrates[4] > STARTING_BITRATE);
        assert_eq!(bitrates[5], bitrates[4]);
        let expected = (STARTING_BITRATE as f64 * 1.05) as i64;
        assert!((bitrates[4] as i64 - expected).abs() <= 2, "{}", bitrates[4]);
    }

    #[test]
    fn clean_periods_never_decrease_bitrate() {
        let mut ctl = BitrateController::default();
        let mut last = 0;
        for _ in 0..200 {
            let b = ctl.get_desired_network_settings(&period(500, 0)).bitrate;
            assert!(b >= last);
            last = b;
        }
        assert_eq!(last, MAXIMUM_BITRATE);
    }

    #[test]
    fn loss_after_boost_returns_to_last_successful() {
        let mut ctl = BitrateController::default();
        for _ in 0..5 {
            ctl.get_desired_network_settings(&period(100, 0));
        }
        let boosted = ctl.current().bitrate;
        assert!(boosted > STARTING_BITRATE);
        let threshold_before = ctl.throughput.threshold;

        let after_loss = ctl.get_desired_network_settings(&period(90, 10)).bitrate;
        assert_eq!(after_loss, STARTING_BITRATE);
        assert!(ctl.throughput.threshold >= threshold_before);
        assert_eq!(ctl.throughput.threshold, 10);
    }

    #[test]
    fn repeated_failed_boosts_double_threshold_up_to_cap() {
        let mut t = ExpectationTracker::new(1000);
        // establish a successful value
        for _ in 0..5 {
            t.observe(1000);
        }
        assert_eq!(t.last_successful, Some(1000));
        let mut thresholds = Vec::new();
        for _ in 0..12 {
            // boosted value loses
            t.observe(t.expected - 1);
            thresholds.push(t.threshold);
            // streak back to a boost
            for _ in 0..t.threshold {
                let e = t.expected;
                t.observe(e);
            }
        }
        assert_eq!(thresholds[0], 10);
        assert!(thresholds.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*thresholds.last().unwrap(), MEET_EXPECTATIONS_MAX);
    }

    #[test]
    fn loss_without_history_blends_with_ewma() {
        let mut t = ExpectationTracker::new(1000);
        t.observe(500);
        assert!((t.expected - 900).abs() <= 1, "{}", t.expected);
        assert_eq!(t.threshold, MEET_EXPECTATIONS_MIN);
        assert_eq!(t.streak, 0);
    }

    // ─── Clamping ───────────────────────────────────────────────────────

    #[test]
    fn heavy_loss_clamps_to_minimum() {
        let mut ctl = BitrateController::default();
        for _ in 0..100 {
            let s = ctl.get_desired_network_settings(&period(1, 99));
            assert!(s.bitrate >= MINIMUM_BITRATE && s.bitrate <= MAXIMUM_BITRATE);
        }
        assert_eq!(ctl.current().bitrate, MINIMUM_BITRATE);
        assert_eq!(
            ctl.throughput.expected,
            (MINIMUM_BITRATE as f64 / BITRATE_THROUGHPUT_RATIO) as i64
        );
    }

    #[test]
    fn burst_follows_skipped_frames() {
        let mut ctl = BitrateController::default();
        let mut stats = period(100, 0);
        stats.num_rendered_frames_per_second = 30;
        stats.num_skipped_frames_per_second = 30;
        let s = ctl.get_desired_network_settings(&stats);
        assert!(s.burst_bitrate < STARTING_BURST_BITRATE);
        assert!(s.burst_bitrate >= MINIMUM_BITRATE);

        // clean rendering never pushes burst above its ceiling
        for _ in 0..100 {
            let s = ctl.get_desired_network_settings(&period(100, 0));
            assert!(s.burst_bitrate <= STARTING_BURST_BITRATE);
        }
    }

    #[test]
    fn pass_through_fields_come_from_defaults() {
        let defaults = NetworkSettings {
            fps: 30,
            fec_packet_ratio: 0.1,
            desired_codec: CodecType::H265,
            ..NetworkSettings::default()
        };
        let mut ctl = BitrateController::with_defaults(BitratePolicy::RatioEwma, defaults);
        let s = ctl.get_desired_network_settings(&period(100, 3));
        assert_eq!(s.fps, 30);
        assert_eq!(s.fec_packet_ratio, 0.1);
        assert_eq!(s.desired_codec, CodecType::H265);
    }

    // ─── Alternative Policies ───────────────────────────────────────────

    #[test]
    fn fallback_policy_switches_on_nack_rate() {
        let mut ctl = BitrateController::new(BitratePolicy::Fallback);
        let s = ctl.get_desired_network_settings(&period(100, 7));
        assert_eq!((s.bitrate, s.burst_bitrate), (BAD_BITRATE, BAD_BURST_BITRATE));
        let s = ctl.get_desired_network_settings(&period(100, 6));
        assert_eq!((s.bitrate, s.burst_bitrate), (STARTING_BITRATE, STARTING_BURST_BITRATE));
    }

    #[test]
    fn ewma_policy_tracks_throughput() {
        let mut ctl = BitrateController::new(BitratePolicy::Ewma);
        let mut stats = period(100, 0);
        stats.throughput_per_second = 8_000_000;
        let mut last = STARTING_BITRATE;
        for _ in 0..50 {
            let s = ctl.get_desired_network_settings(&stats);
            assert!(s.bitrate <= last);
            last = s.bitrate;
        }
        assert!((last as i64 - 10_000_000).abs() < 10_000, "{last}");
    }

    #[test]
    fn codec_from_u16() {
        assert_eq!(CodecType::from_u16(264), CodecType::H264);
        assert_eq!(CodecType::from_u16(265), CodecType::H265);
        assert_eq!(CodecType::from_u16(1), CodecType::Unknown);
    }
}
