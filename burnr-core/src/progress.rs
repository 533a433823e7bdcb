//! Throttled progress reporting.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of interval speed samples the reported speed is averaged over.
const SPEED_SAMPLES: usize = 10;

/// A progress snapshot handed to observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub processed_bytes: u64,
    pub total_bytes: u64,
    /// Weighted moving average, in bytes per second.
    pub speed: f64,
    pub is_verifying: bool,
}

impl Progress {
    /// Completion in percent, or 0 when the total is unknown.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.processed_bytes as f64 * 100.0 / self.total_bytes as f64
        }
    }
}

/// Turns a stream of per-chunk byte counts into at most one [`Progress`]
/// per interval.
///
/// Every emitted update computes the speed over the interval since the
/// previous one and reports the average of the last [`SPEED_SAMPLES`]
/// samples, weighted 1..n from oldest to newest. Unless the pass was
/// opened with [`ProgressMeter::start`], the first chunk always produces an
/// update.
#[derive(Debug)]
pub struct ProgressMeter {
    interval: Duration,
    total_bytes: u64,
    is_verifying: bool,
    started: Instant,
    last_update: Option<Instant>,
    bytes_since_update: u64,
    samples: VecDeque<f64>,
}

impl ProgressMeter {
    pub fn new(interval: Duration, total_bytes: u64, is_verifying: bool) -> Self {
        Self {
            interval,
            total_bytes,
            is_verifying,
            started: Instant::now(),
            last_update: None,
            bytes_since_update: 0,
            samples: VecDeque::with_capacity(SPEED_SAMPLES),
        }
    }

    /// Emits the snapshot for the start of a pass, at `processed` bytes.
    /// The next update is due one interval later.
    pub fn start(&mut self, processed: u64) -> Progress {
        self.start_at(Instant::now(), processed)
    }

    pub fn start_at(&mut self, now: Instant, processed: u64) -> Progress {
        self.started = now;
        self.last_update = Some(now);
        self.bytes_since_update = 0;
        Progress {
            processed_bytes: processed,
            total_bytes: self.total_bytes,
            speed: self.speed(),
            is_verifying: self.is_verifying,
        }
    }

    /// Records `chunk` more bytes, `processed` in total.
    pub fn record(&mut self, chunk: u64, processed: u64) -> Option<Progress> {
        self.record_at(Instant::now(), chunk, processed)
    }

    pub fn record_at(&mut self, now: Instant, chunk: u64, processed: u64) -> Option<Progress> {
        self.bytes_since_update += chunk;
        let since = self.last_update.unwrap_or(self.started);
        if self.last_update.is_some() && now.duration_since(since) < self.interval {
            return None;
        }

        let elapsed = match now.duration_since(since) {
            d if d.is_zero() => self.interval,
            d => d,
        };
        let sample = if elapsed.is_zero() {
            0.0
        } else {
            self.bytes_since_update as f64 / elapsed.as_secs_f64()
        };
        if self.samples.len() == SPEED_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        self.last_update = Some(now);
        self.bytes_since_update = 0;
        Some(Progress {
            processed_bytes: processed,
            total_bytes: self.total_bytes,
            speed: self.speed(),
            is_verifying: self.is_verifying,
        })
    }

    /// Current weighted average speed in bytes per second.
    pub fn speed(&self) -> f64 {
        let weights: f64 = (1..=self.samples.len()).map(|w| w as f64).sum();
        if weights == 0.0 {
            return 0.0;
        }
        self.samples
            .iter()
            .enumerate()
            .map(|(i, s)| s * (i + 1) as f64)
            .sum::<f64>()
            / weights
    }
}
