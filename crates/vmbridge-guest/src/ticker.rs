//! Rescan tick sources.
//!
//! The event loop rescans whenever its ticker fires. The plain shape is a
//! fixed interval; on capable kernels the bind watcher adds an immediate
//! tick whenever something in the guest binds a socket, and the compound
//! shape merges both so a slow interval still provides a safety net.

use std::time::{Duration, Instant};

use tokio::time::{Interval, MissedTickBehavior};

use vmbridge_ebpf::{BindWatch, BindWatchConfig};

/// A closed set of tick sources.
pub enum Ticker {
    /// Fixed interval.
    Simple(Interval),
    /// Interval plus eBPF bind events.
    Compound(Interval, BindWatch),
}

impl Ticker {
    /// Creates an interval ticker.
    #[must_use]
    pub fn simple(period: Duration) -> Self {
        Self::Simple(make_interval(period))
    }

    /// Creates a compound ticker when the bind watcher loads, degrading to
    /// the plain interval otherwise.
    #[must_use]
    pub fn with_bind_watch(period: Duration, config: &BindWatchConfig) -> Self {
        match BindWatch::load(config) {
            Ok(watch) => {
                tracing::info!("compound ticker: interval + bind watcher");
                Self::Compound(make_interval(period), watch)
            }
            Err(e) => {
                tracing::info!(error = %e, "bind watcher unavailable; using interval ticker");
                Self::simple(period)
            }
        }
    }

    /// Waits for the next tick. A closed bind watcher degrades the ticker
    /// to interval-only in place; the interval itself never closes, so the
    /// returned option is `Some` for the lifetime of the agent.
    pub async fn tick(&mut self) -> Option<Instant> {
        loop {
            let fallback_period = match self {
                Self::Simple(interval) => return Some(interval.tick().await.into_std()),
                Self::Compound(interval, watch) => {
                    tokio::select! {
                        at = interval.tick() => return Some(at.into_std()),
                        bind = watch.recv() => match bind {
                            Some(at) => return Some(at),
                            None => interval.period(),
                        },
                    }
                }
            };
            // The watcher died; fall back to interval-only.
            tracing::warn!("bind watcher closed; degrading to interval ticker");
            *self = Self::simple(fallback_period);
        }
    }
}

fn make_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn simple_ticker_fires_on_schedule() {
        let mut ticker = Ticker::simple(Duration::from_secs(3));
        // The first tick completes immediately, the second after one period.
        let _ = ticker.tick().await;
        let before = tokio::time::Instant::now();
        let _ = ticker.tick().await;
        assert_eq!(tokio::time::Instant::now() - before, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn degraded_compound_falls_back_to_interval() {
        // Without the ebpf feature the watcher never loads, so this is
        // already the degradation path.
        let mut ticker = Ticker::with_bind_watch(
            Duration::from_millis(1),
            &BindWatchConfig::default(),
        );
        assert!(ticker.tick().await.is_some());
    }
}
