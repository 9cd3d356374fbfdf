//! Timing primitives for Roomcast rooms.
//!
//! - [`TickScheduler`]: fixed-rate ticks for the simulation loop and the
//!   patch cadence, with pause/resume and overrun handling.
//! - [`RepeatingTask`] / [`DelayedTask`]: cancellable timers for
//!   per-player liveness probes, start countdowns, and reconnect windows.
//!   Cancellation uses a `tokio_util` [`CancellationToken`].
//!
//! Everything runs on the Tokio timer, so tests pause the clock and
//! advance virtual time instead of sleeping.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

mod scheduler;
mod task;

pub use scheduler::{TickConfig, TickInfo, TickMetrics, TickPolicy, TickScheduler};
pub use task::{Cadence, DelayedTask, RepeatingTask};
