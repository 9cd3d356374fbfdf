//! Fixed-rate scheduler for simulation ticks and patch cadence.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when the loop wakes up later than scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TickPolicy {
    /// Forget the missed ticks and schedule the next one from now.
    #[default]
    Skip,
    /// Keep the original cadence; the next tick fires at its planned time
    /// even if that is already in the past.
    Drop,
}

/// Configuration for one [`TickScheduler`].
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Rate in Hz. 0 means the scheduler never fires.
    pub tick_rate_hz: u32,
    pub policy: TickPolicy,
    /// Fraction of the tick budget (0.0–1.0) above which a warning is
    /// logged by [`TickScheduler::record_tick_end`].
    pub budget_warn_threshold: f64,
    /// Random delay (0–max µs) added to the first tick so rooms created
    /// together don't tick in lockstep.
    pub initial_jitter_us: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 0,
            policy: TickPolicy::default(),
            budget_warn_threshold: 0.80,
            initial_jitter_us: 2_000,
        }
    }
}

impl TickConfig {
    /// Highest rate a room may ask for.
    pub const MAX_TICK_RATE_HZ: u32 = 60;

    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self {
            tick_rate_hz,
            ..Default::default()
        }
    }

    /// Clamps out-of-range values. Called by [`TickScheduler::new`].
    ///
    /// - `tick_rate_hz` capped to [`Self::MAX_TICK_RATE_HZ`].
    /// - `budget_warn_threshold` clamped to `0.0..=1.0` (NaN becomes 1.0).
    pub fn validated(mut self) -> Self {
        if self.tick_rate_hz > Self::MAX_TICK_RATE_HZ {
            warn!(
                rate = self.tick_rate_hz,
                max = Self::MAX_TICK_RATE_HZ,
                "tick rate above maximum, clamping"
            );
            self.tick_rate_hz = Self::MAX_TICK_RATE_HZ;
        }
        self.budget_warn_threshold = if self.budget_warn_threshold.is_nan() {
            1.0
        } else {
            self.budget_warn_threshold.clamp(0.0, 1.0)
        };
        self
    }

    /// Length of one tick, or `None` when the rate is 0.
    pub fn tick_duration(&self) -> Option<Duration> {
        (self.tick_rate_hz > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz)))
    }
}

// ---------------------------------------------------------------------------
// Tick info
// ---------------------------------------------------------------------------

/// Returned by [`TickScheduler::wait_for_tick`].
#[derive(Debug, Clone)]
pub struct TickInfo {
    /// Starts at 1 and only goes up.
    pub tick: u64,
    /// Fixed step (`1 / rate`), independent of wall-clock drift.
    pub dt: Duration,
    /// The loop woke up more than 10% of a tick late.
    pub overrun: bool,
    /// Whole ticks skipped because of the overrun.
    pub ticks_skipped: u64,
}

/// Counters kept by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct TickMetrics {
    pub total_ticks: u64,
    pub total_overruns: u64,
    pub total_skipped: u64,
    /// Longest work time reported through `record_tick_end`.
    pub max_tick_time: Duration,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Fixed-rate tick source for a room actor's `select!` loop.
///
/// ```ignore
/// loop {
///     tokio::select! {
///         Some(cmd) = commands.recv() => { /* ... */ }
///         info = patches.wait_for_tick() => {
///             room.before_patch().await;
///             patches.record_tick_end();
///         }
///     }
/// }
/// ```
pub struct TickScheduler {
    config: TickConfig,
    tick_duration: Option<Duration>,
    tick_count: u64,
    next_tick: Option<TokioInstant>,
    tick_start: Option<Instant>,
    paused: bool,
    metrics: TickMetrics,
}

impl TickScheduler {
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        let tick_duration = config.tick_duration();
        let next_tick = tick_duration.map(|d| TokioInstant::now() + d + first_tick_jitter(&config));

        debug!(
            rate_hz = config.tick_rate_hz,
            policy = ?config.policy,
            "tick scheduler created"
        );

        Self {
            config,
            tick_duration,
            tick_count: 0,
            next_tick,
            tick_start: None,
            paused: false,
            metrics: TickMetrics::default(),
        }
    }

    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self::new(TickConfig::with_rate(tick_rate_hz))
    }

    /// Creates a scheduler that starts out paused.
    pub fn paused(config: TickConfig) -> Self {
        let mut scheduler = Self::new(config);
        scheduler.paused = true;
        scheduler
    }

    /// Waits until the next tick is due.
    ///
    /// Pends forever while paused or when the rate is 0, so it is safe to
    /// leave in a `select!` branch.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        let (next, step) = match (self.next_tick, self.tick_duration) {
            (Some(next), Some(step)) if !self.paused => (next, step),
            _ => return std::future::pending().await,
        };

        time::sleep_until(next).await;

        let now = TokioInstant::now();
        self.tick_count += 1;
        self.tick_start = Some(Instant::now());

        let late_by = now.saturating_duration_since(next);
        let overrun = late_by > step / 10;
        let mut ticks_skipped = 0;

        self.next_tick = Some(match self.config.policy {
            TickPolicy::Skip => {
                if overrun {
                    ticks_skipped = (late_by.as_nanos() / step.as_nanos()) as u64;
                    if ticks_skipped > 0 {
                        warn!(
                            tick = self.tick_count,
                            skipped = ticks_skipped,
                            late_ms = late_by.as_secs_f64() * 1000.0,
                            "tick overrun, skipping ahead"
                        );
                    }
                }
                now + step
            }
            TickPolicy::Drop => next + step,
        });

        if overrun {
            self.metrics.total_overruns += 1;
        }
        self.metrics.total_skipped += ticks_skipped;
        self.metrics.total_ticks += 1;

        trace!(tick = self.tick_count, overrun, "tick fired");

        TickInfo {
            tick: self.tick_count,
            dt: step,
            overrun,
            ticks_skipped,
        }
    }

    /// Reports that the work for the current tick is done.
    ///
    /// Logs a warning when the work took more than the configured share of
    /// the tick budget.
    pub fn record_tick_end(&mut self) {
        let Some(start) = self.tick_start.take() else {
            return;
        };
        let elapsed = start.elapsed();
        self.metrics.max_tick_time = self.metrics.max_tick_time.max(elapsed);

        if let Some(budget) = self.tick_duration {
            let utilization = elapsed.as_secs_f64() / budget.as_secs_f64();
            if utilization >= self.config.budget_warn_threshold {
                warn!(
                    tick = self.tick_count,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    budget_ms = budget.as_secs_f64() * 1000.0,
                    "tick work near or over budget"
                );
            }
        }
    }

    /// Stops ticking until [`resume`](Self::resume). Idempotent.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!(tick = self.tick_count, "tick scheduler paused");
        }
    }

    /// Resumes ticking one full step from now, without a burst of missed
    /// ticks. Idempotent.
    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.next_tick = self.tick_duration.map(|step| TokioInstant::now() + step);
            debug!(tick = self.tick_count, "tick scheduler resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.config.tick_rate_hz
    }

    pub fn tick_duration(&self) -> Option<Duration> {
        self.tick_duration
    }
}

fn first_tick_jitter(config: &TickConfig) -> Duration {
    if config.initial_jitter_us == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::rng().random_range(0..config.initial_jitter_us))
}
