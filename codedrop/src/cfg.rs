//! Transfer configuration.

use std::{
    num::{NonZeroU32, NonZeroUsize},
    time::Duration,
};

/// Configuration of a transfer session.
///
/// For most use cases the default configuration, i.e. [`Cfg::default()`](Self::default),
/// should be used. The parameters critical to throughput are the chunk size
/// bounds and the channel buffer watermarks; if a transfer is under-performing
/// over a fat link, try raising [`chunk_size_max`](Self::chunk_size_max).
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::manual_non_exhaustive)]
pub struct Cfg {
    /// Nominal chunk size in bytes, used before any round-trip has been measured.
    pub chunk_size: NonZeroUsize,
    /// Lower bound for the adaptive chunk size.
    pub chunk_size_min: NonZeroUsize,
    /// Upper bound for the adaptive chunk size.
    pub chunk_size_max: NonZeroUsize,
    /// Upper bound for the dynamic send window, in chunks.
    ///
    /// The window chosen from round-trip tiers never exceeds this.
    pub window_limit: NonZeroUsize,
    /// Buffered bytes on a data channel above which it is not eligible for sending.
    pub max_buffer: NonZeroUsize,
    /// Buffered bytes below which a suspended sender resumes.
    pub buffer_low: NonZeroUsize,
    /// Bound on the time the sender waits for a buffered-low edge before re-checking.
    pub backpressure_poll: Duration,
    /// Number of parallel data channels the sender is wired for.
    pub parallel_channels: NonZeroUsize,
    /// Number of received chunks that forces an acknowledgement flush.
    pub sack_batch: NonZeroUsize,
    /// Longest time a pending acknowledgement may be withheld.
    pub sack_flush_interval: Duration,
    /// Keepalive ping interval on the control channel.
    pub keepalive_interval: Duration,
    /// Heartbeat interval towards the signaling service.
    pub heartbeat_interval: Duration,
    /// Base interval before an unacknowledged chunk is resent.
    pub retransmit_interval: Duration,
    /// Exponent cap for retransmission backoff (`interval · 2^min(retries, cap)`).
    pub retransmit_backoff_cap: u32,
    /// Absolute cap on the backoff interval, as a multiple of the base interval.
    pub retransmit_interval_cap: NonZeroU32,
    /// Retries of a single chunk after which a warning is emitted.
    pub retry_soft_limit: u32,
    /// Retries of a single chunk after which the peer is considered unresponsive.
    pub retry_hard_limit: u32,
    /// Consecutive decryption failures across distinct chunks after which the
    /// shared key is assumed to be mismatched.
    pub decrypt_failure_limit: NonZeroUsize,
    /// Session inactivity timeout.
    pub session_timeout: Duration,
    /// Capacity of the pacing token bucket in bytes.
    pub bucket_capacity: NonZeroUsize,
    /// Bootstrap fill rate of the token bucket in bytes per second, used until
    /// enough round-trip samples exist.
    pub fill_rate_bootstrap: NonZeroUsize,
    /// Fill rate in bytes per second that a perfectly stable round-trip converges to.
    pub fill_rate_target: NonZeroUsize,
    /// Number of round-trip samples kept for window and chunk-size selection.
    pub rtt_window: NonZeroUsize,
    /// Reorder buffer capacity as a multiple of the dynamic send window.
    pub reorder_factor: NonZeroUsize,
    /// Largest file size for which the end-to-end digest is verified at assembly.
    pub verify_limit: u64,
    /// Largest message the transport accepts on a data channel.
    ///
    /// Chunks are clamped so that `frame header + ciphertext` never exceeds this.
    pub max_message_size: NonZeroUsize,
    #[doc(hidden)]
    pub _non_exhaustive: (),
}

impl Default for Cfg {
    /// The default configuration.
    fn default() -> Self {
        Self {
            chunk_size: NonZeroUsize::new(256 * 1024).unwrap(),
            chunk_size_min: NonZeroUsize::new(128 * 1024).unwrap(),
            chunk_size_max: NonZeroUsize::new(1024 * 1024).unwrap(),
            window_limit: NonZeroUsize::new(64).unwrap(),
            max_buffer: NonZeroUsize::new(4 * 1024 * 1024).unwrap(),
            buffer_low: NonZeroUsize::new(2 * 1024 * 1024).unwrap(),
            backpressure_poll: Duration::from_millis(500),
            parallel_channels: NonZeroUsize::new(3).unwrap(),
            sack_batch: NonZeroUsize::new(50).unwrap(),
            sack_flush_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            retransmit_interval: Duration::from_secs(1),
            retransmit_backoff_cap: 3,
            retransmit_interval_cap: NonZeroU32::new(10).unwrap(),
            retry_soft_limit: 5,
            retry_hard_limit: 50,
            decrypt_failure_limit: NonZeroUsize::new(8).unwrap(),
            session_timeout: Duration::from_secs(600),
            bucket_capacity: NonZeroUsize::new(50 * 1024 * 1024).unwrap(),
            fill_rate_bootstrap: NonZeroUsize::new(10 * 1024 * 1024).unwrap(),
            fill_rate_target: NonZeroUsize::new(20 * 1024 * 1024).unwrap(),
            rtt_window: NonZeroUsize::new(16).unwrap(),
            reorder_factor: NonZeroUsize::new(4).unwrap(),
            verify_limit: 250 * 1024 * 1024,
            max_message_size: NonZeroUsize::new(262_144).unwrap(),
            _non_exhaustive: (),
        }
    }
}

impl Cfg {
    /// Largest chunk payload the transport permits, accounting for the frame
    /// header and the AEAD tag.
    pub fn transport_chunk_limit(&self) -> usize {
        self.max_message_size
            .get()
            .saturating_sub(crate::frame::HEADER_LEN + crate::crypto::TAG_LEN)
            .max(1)
    }
}
