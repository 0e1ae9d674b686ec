//! Pacing and adaptive sizing.
//!
//! The flow controller is advisory: it owns the token bucket that paces
//! sending and derives the dynamic window and chunk size from recent
//! round-trip measurements. The sender consults it before producing new
//! chunks; retransmissions bypass it and reuse the size recorded at first
//! send.

use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

use crate::cfg::Cfg;

/// Round-trip tiers driving window and chunk-size selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTier {
    /// Below 50 ms.
    Lan,
    /// Below 100 ms.
    Fiber,
    /// Below 200 ms.
    Broadband,
    /// Everything slower.
    Slow,
}

impl LinkTier {
    fn of(rtt: Duration) -> Self {
        match rtt.as_millis() {
            0..=49 => Self::Lan,
            50..=99 => Self::Fiber,
            100..=199 => Self::Broadband,
            _ => Self::Slow,
        }
    }

    fn window(self) -> usize {
        match self {
            Self::Lan => 64,
            Self::Fiber => 32,
            Self::Broadband => 16,
            Self::Slow => 8,
        }
    }
}

/// Token bucket plus round-trip statistics owned by the sender.
#[derive(Debug)]
pub struct FlowController {
    tokens: f64,
    capacity: f64,
    fill_rate: f64,
    last_refill: Instant,
    rtt: VecDeque<Duration>,
    rtt_cap: usize,
    cfg: FlowCfg,
}

#[derive(Debug, Clone)]
struct FlowCfg {
    chunk_min: usize,
    chunk_max: usize,
    chunk_nominal: usize,
    window_limit: usize,
    fill_rate_target: f64,
}

impl FlowController {
    /// Minimum number of round-trip samples before the fill rate adapts.
    const MIN_SAMPLES: usize = 5;

    /// Chunks kept in flight per round-trip when sizing chunks.
    const CHUNKS_PER_RTT: f64 = 3.0;

    /// Creates a controller from the session configuration.
    pub fn new(cfg: &Cfg) -> Self {
        let capacity = cfg.bucket_capacity.get() as f64;
        Self {
            tokens: capacity,
            capacity,
            fill_rate: cfg.fill_rate_bootstrap.get() as f64,
            last_refill: Instant::now(),
            rtt: VecDeque::with_capacity(cfg.rtt_window.get()),
            rtt_cap: cfg.rtt_window.get(),
            cfg: FlowCfg {
                chunk_min: cfg.chunk_size_min.get(),
                chunk_max: cfg.chunk_size_max.get(),
                chunk_nominal: cfg.chunk_size.get(),
                window_limit: cfg.window_limit.get(),
                fill_rate_target: cfg.fill_rate_target.get() as f64,
            },
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.fill_rate).min(self.capacity);
    }

    /// Whether `bytes` may be sent now; deducts the tokens on success.
    pub fn can_send(&mut self, bytes: usize) -> bool {
        self.refill();
        let bytes = bytes as f64;
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    /// Time until enough tokens for `bytes` have accumulated.
    pub fn time_until(&mut self, bytes: usize) -> Duration {
        self.refill();
        let missing = bytes as f64 - self.tokens;
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.fill_rate)
        }
    }

    /// Records a round-trip sample and re-derives the fill rate.
    ///
    /// The fill rate converges towards the configured target scaled by the
    /// stability of the recent round-trips: a jittery path earns a lower rate.
    pub fn observe_rtt(&mut self, rtt: Duration) {
        if self.rtt.len() == self.rtt_cap {
            self.rtt.pop_front();
        }
        self.rtt.push_back(rtt);

        if self.rtt.len() >= Self::MIN_SAMPLES {
            let mean = self.mean_rtt_secs();
            let min = self.rtt.iter().min().map(|d| d.as_secs_f64()).unwrap_or(0.0);
            let max = self.rtt.iter().max().map(|d| d.as_secs_f64()).unwrap_or(0.0);
            let stability = if mean > 0.0 { 1.0 - ((max - min) / mean).min(1.0) } else { 1.0 };
            self.fill_rate = 0.8 * self.fill_rate + 0.2 * (stability * self.cfg.fill_rate_target);
        }
    }

    fn mean_rtt_secs(&self) -> f64 {
        if self.rtt.is_empty() {
            return 0.0;
        }
        self.rtt.iter().map(|d| d.as_secs_f64()).sum::<f64>() / self.rtt.len() as f64
    }

    /// Rolling mean round-trip, if any sample exists.
    pub fn mean_rtt(&self) -> Option<Duration> {
        if self.rtt.is_empty() {
            None
        } else {
            Some(Duration::from_secs_f64(self.mean_rtt_secs()))
        }
    }

    /// Current link tier from the rolling mean round-trip.
    pub fn tier(&self) -> Option<LinkTier> {
        self.mean_rtt().map(LinkTier::of)
    }

    /// Dynamic send window in chunks, step-wise from the round-trip tiers.
    pub fn window_size(&self) -> usize {
        let tier_window = match self.tier() {
            Some(tier) => tier.window(),
            None => LinkTier::Broadband.window(),
        };
        tier_window.min(self.cfg.window_limit)
    }

    /// Chunk size targeting roughly three chunks in flight per round-trip,
    /// clamped to the configured bounds. Applies to future chunks only.
    pub fn optimal_chunk_size(&self) -> usize {
        let Some(rtt) = self.mean_rtt() else { return self.cfg.chunk_nominal };
        let ideal = self.fill_rate * rtt.as_secs_f64() / Self::CHUNKS_PER_RTT;
        (ideal as usize).clamp(self.cfg.chunk_min, self.cfg.chunk_max)
    }

    /// Current fill rate in bytes per second.
    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }
}
