//! Adaptive quality model: connection metrics, tier classification, and the
//! encoding preset applied at each tier.
//!
//! The negotiation layer samples the media transport every couple of seconds,
//! computes a packet-loss rate for just that interval (lifetime totals would
//! bury a fresh network problem under old history), classifies the connection
//! into a [`QualityTier`], and applies the tier's [`EncodingPreset`] whenever
//! the tier changes.
//!
//! A tier is only awarded when *both* metrics qualify: a link with perfect
//! latency but 10% loss is still a bad link.

use serde::{Deserialize, Serialize};

/// Target bitrate for a pristine connection, in bits per second.
pub const MAX_BITRATE: u32 = 8_000_000;

// RTT ceilings per tier, in milliseconds.
const EXCELLENT_MAX_RTT_MS: f64 = 50.0;
const GOOD_MAX_RTT_MS: f64 = 150.0;
const POOR_MAX_RTT_MS: f64 = 300.0;

// Packet-loss ceilings per tier, as a fraction of packets sent.
const EXCELLENT_MAX_LOSS: f64 = 0.01;
const GOOD_MAX_LOSS: f64 = 0.03;
const POOR_MAX_LOSS: f64 = 0.08;

/// Raw counters sampled from a media transport.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    /// Round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Lifetime count of packets sent.
    pub packets_sent: u64,
    /// Lifetime count of packets lost.
    pub packets_lost: u64,
}

/// Connection quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityTier {
    Excellent,
    Good,
    Poor,
    Bad,
}

/// Encoder parameters applied to a media sender for one quality tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodingPreset {
    /// Maximum video bitrate in bits per second.
    pub max_bitrate: u32,
    /// Maximum frames per second.
    pub max_framerate: u32,
    /// Resolution divisor; 2.0 halves both dimensions.
    pub scale_resolution_down_by: f64,
}

impl QualityTier {
    /// Classifies a connection from its round-trip time and interval loss
    /// rate.  Both metrics must satisfy a tier for it to be awarded.
    pub fn classify(rtt_ms: f64, loss: f64) -> Self {
        if rtt_ms <= EXCELLENT_MAX_RTT_MS && loss <= EXCELLENT_MAX_LOSS {
            QualityTier::Excellent
        } else if rtt_ms <= GOOD_MAX_RTT_MS && loss <= GOOD_MAX_LOSS {
            QualityTier::Good
        } else if rtt_ms <= POOR_MAX_RTT_MS && loss <= POOR_MAX_LOSS {
            QualityTier::Poor
        } else {
            QualityTier::Bad
        }
    }

    /// Returns the encoding preset for this tier.
    pub fn preset(self) -> EncodingPreset {
        match self {
            QualityTier::Excellent => EncodingPreset {
                max_bitrate: MAX_BITRATE,
                max_framerate: 30,
                scale_resolution_down_by: 1.0,
            },
            QualityTier::Good => EncodingPreset {
                max_bitrate: (MAX_BITRATE as f64 * 0.7) as u32,
                max_framerate: 24,
                scale_resolution_down_by: 1.0,
            },
            QualityTier::Poor => EncodingPreset {
                max_bitrate: (MAX_BITRATE as f64 * 0.4) as u32,
                max_framerate: 15,
                scale_resolution_down_by: 1.5,
            },
            QualityTier::Bad => EncodingPreset {
                max_bitrate: 500_000,
                max_framerate: 10,
                scale_resolution_down_by: 2.0,
            },
        }
    }
}

/// Packet-loss rate over the interval between two samples.
///
/// Counters are lifetime totals, so the interval rate is the delta of lost
/// over the delta of sent.  Returns 0.0 when nothing was sent in the interval
/// (an idle link is not a lossy link).  Counter resets (transport restart)
/// also yield 0.0 for that one interval.
pub fn interval_loss(previous: TransportStats, current: TransportStats) -> f64 {
    let sent = current.packets_sent.saturating_sub(previous.packets_sent);
    let lost = current.packets_lost.saturating_sub(previous.packets_lost);
    if sent == 0 {
        return 0.0;
    }
    (lost as f64 / sent as f64).clamp(0.0, 1.0)
}
