//! Timing primitives for cycle-driven playback.
//!
//! - [`TransportClock`] - Shared beat clock advanced once per control cycle
//! - [`beats_to_seconds`] / [`seconds_to_beats`] - Tempo conversions

/// Tolerance used when comparing beat positions.
pub const EPSILON: f64 = 1e-9;

/// Lowest accepted tempo in BPM.
pub const MIN_BPM: f64 = 1.0;
/// Highest accepted tempo in BPM.
pub const MAX_BPM: f64 = 999.0;

/// Clamp a tempo into the accepted BPM range.
pub fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() {
        bpm.clamp(MIN_BPM, MAX_BPM)
    } else {
        MIN_BPM
    }
}

/// Convert a beat count to seconds at the given tempo.
pub fn beats_to_seconds(beats: f64, bpm: f64) -> f64 {
    beats * 60.0 / clamp_bpm(bpm)
}

/// Convert seconds to a beat count at the given tempo.
pub fn seconds_to_beats(seconds: f64, bpm: f64) -> f64 {
    seconds * clamp_bpm(bpm) / 60.0
}

/// Transport clock advanced by the engine's control cycles.
///
/// Unlike a wall-clock transport, the position only moves when
/// [`TransportClock::advance`] is called, so a halted engine halts the
/// transport as well.
#[derive(Clone, Debug)]
pub struct TransportClock {
    bpm: f64,
    running: bool,
    position: f64,
}

impl Default for TransportClock {
    fn default() -> Self {
        Self::new(120.0)
    }
}

impl TransportClock {
    /// Create a stopped transport at beat 0.
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm: clamp_bpm(bpm),
            running: false,
            position: 0.0,
        }
    }

    /// Set the BPM, preserving the current beat position.
    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = clamp_bpm(bpm);
    }

    /// Get the current BPM.
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop the transport, preserving the current beat position.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Check if the transport is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Jump to a beat position. Backward jumps are allowed.
    pub fn seek(&mut self, beat: f64) {
        self.position = beat.max(0.0);
    }

    /// Advance by one cycle of `seconds` if running; returns the new position.
    pub fn advance(&mut self, seconds: f64) -> f64 {
        if self.running {
            self.position += seconds_to_beats(seconds, self.bpm);
        }
        self.position
    }

    /// Current beat position.
    pub fn position(&self) -> f64 {
        self.position
    }
}
