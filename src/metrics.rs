//! Metrics collection and export for session pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Occupancy snapshot taken under the pool lock
///
/// # Examples
///
/// ```
/// use sessionpool::Stats;
///
/// let stats = Stats { limit: 10, index: 4, idle: 3, create_in_progress: 1, waiting: 0 };
/// assert_eq!(stats.busy(), 1);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct Stats {
    /// Maximum number of items
    pub limit: usize,

    /// Items that currently exist
    pub index: usize,

    /// Items parked in the idle list
    pub idle: usize,

    /// Creations admitted but not yet finished
    pub create_in_progress: usize,

    /// Callers parked in the wait queue
    pub waiting: usize,
}

impl Stats {
    /// Items handed out to callers
    pub fn busy(&self) -> usize {
        self.index.saturating_sub(self.idle)
    }
}

/// Cumulative counters for a pool, plus its current occupancy
#[derive(Debug, Clone)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Items successfully created
    pub items_created: usize,

    /// Creations that failed or timed out
    pub create_failures: usize,

    /// Items handed to the disposer
    pub items_closed: usize,

    /// Items handed out to callers
    pub checkouts: usize,

    /// Items accepted back into the pool
    pub returns: usize,

    /// Acquisitions that found neither an idle item nor admission room
    pub overflow_events: usize,

    /// Acquisitions that parked in the wait queue
    pub wait_events: usize,

    /// Idle items closed for staleness or death
    pub evictions: usize,

    /// Current busy items
    pub busy_items: usize,

    /// Current idle items
    pub idle_items: usize,

    /// Busy items over the limit (0.0 to 1.0)
    pub utilization: f64,

    /// Maximum number of items
    pub limit: usize,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("items_created".to_string(), self.items_created.to_string());
        metrics.insert("create_failures".to_string(), self.create_failures.to_string());
        metrics.insert("items_closed".to_string(), self.items_closed.to_string());
        metrics.insert("checkouts".to_string(), self.checkouts.to_string());
        metrics.insert("returns".to_string(), self.returns.to_string());
        metrics.insert("overflow_events".to_string(), self.overflow_events.to_string());
        metrics.insert("wait_events".to_string(), self.wait_events.to_string());
        metrics.insert("evictions".to_string(), self.evictions.to_string());
        metrics.insert("busy_items".to_string(), self.busy_items.to_string());
        metrics.insert("idle_items".to_string(), self.idle_items.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("limit".to_string(), self.limit.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus text format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use sessionpool::{MetricsExporter, Pool, PoolConfiguration, ServiceError};
    /// use std::collections::HashMap;
    /// # use sessionpool::{BoxError, Item};
    /// # use tokio_util::sync::CancellationToken;
    /// # struct Session;
    /// # #[async_trait::async_trait]
    /// # impl Item for Session {
    /// #     fn is_alive(&self) -> bool { true }
    /// #     async fn close(&mut self, _token: &CancellationToken) -> Result<(), BoxError> {
    /// #         Ok(())
    /// #     }
    /// # }
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let pool: Pool<Session, ServiceError> =
    ///     Pool::new(PoolConfiguration::new(|_token| async { Ok(Session) }));
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&pool.metrics(), "main", Some(&tags));
    /// assert!(output.contains("sessionpool_items_busy"));
    /// assert!(output.contains("service=\"api\""));
    /// # }
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        // Gauge metrics
        let gauges = [
            ("sessionpool_items_busy", "Current busy items", metrics.busy_items),
            ("sessionpool_items_idle", "Current idle items", metrics.idle_items),
            ("sessionpool_limit", "Maximum number of items", metrics.limit),
        ];
        for (name, help, value) in gauges {
            Self::push(&mut output, name, "gauge", help, &labels, value);
        }

        output.push_str("# HELP sessionpool_utilization Busy items over the limit\n");
        output.push_str("# TYPE sessionpool_utilization gauge\n");
        output.push_str(&format!(
            "sessionpool_utilization{{{}}} {:.2}\n",
            labels, metrics.utilization
        ));

        // Counter metrics
        let counters = [
            ("sessionpool_items_created_total", "Items created", metrics.items_created),
            ("sessionpool_create_failures_total", "Failed item creations", metrics.create_failures),
            ("sessionpool_items_closed_total", "Items closed", metrics.items_closed),
            ("sessionpool_checkouts_total", "Items handed out", metrics.checkouts),
            ("sessionpool_returns_total", "Items returned", metrics.returns),
            ("sessionpool_overflow_events_total", "Overflow events", metrics.overflow_events),
            ("sessionpool_wait_events_total", "Wait queue entries", metrics.wait_events),
            ("sessionpool_evictions_total", "Idle items evicted", metrics.evictions),
        ];
        for (name, help, value) in counters {
            Self::push(&mut output, name, "counter", help, &labels, value);
        }

        output
    }

    fn push(output: &mut String, name: &str, kind: &str, help: &str, labels: &str, value: usize) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal metrics tracker
#[derive(Debug, Default)]
pub(crate) struct MetricsTracker {
    pub items_created: AtomicUsize,
    pub create_failures: AtomicUsize,
    pub items_closed: AtomicUsize,
    pub checkouts: AtomicUsize,
    pub returns: AtomicUsize,
    pub overflow_events: AtomicUsize,
    pub wait_events: AtomicUsize,
    pub evictions: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, stats: &Stats) -> PoolMetrics {
        let busy = stats.busy();
        let utilization = if stats.limit > 0 {
            busy as f64 / stats.limit as f64
        } else {
            0.0
        };

        PoolMetrics {
            items_created: self.items_created.load(Ordering::Relaxed),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            items_closed: self.items_closed.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            wait_events: self.wait_events.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            busy_items: busy,
            idle_items: stats.idle,
            utilization,
            limit: stats.limit,
        }
    }
}

#[cfg(feature = "metrics")]
pub use self::prometheus_trace::PrometheusTrace;

#[cfg(feature = "metrics")]
mod prometheus_trace {
    use std::fmt;

    use prometheus::{IntCounter, IntGauge, Opts, Registry};

    use crate::trace::{ChangeInfo, CloseDoneInfo, NewInfo, PoolTrace, TryDoneInfo, WithDoneInfo};

    /// [`PoolTrace`] that feeds a Prometheus registry
    ///
    /// Every series carries a constant `pool` label.
    pub struct PrometheusTrace {
        pool: String,
        limit: IntGauge,
        index: IntGauge,
        idle: IntGauge,
        create_in_progress: IntGauge,
        waiting: IntGauge,
        tries: IntCounter,
        try_errors: IntCounter,
        withs: IntCounter,
        with_errors: IntCounter,
        with_attempts: IntCounter,
        closes: IntCounter,
    }

    impl PrometheusTrace {
        pub fn new(pool: &str) -> prometheus::Result<Self> {
            let opts = |name: &str, help: &str| {
                Opts::new(name, help)
                    .namespace("sessionpool")
                    .const_label("pool", pool)
            };

            Ok(Self {
                pool: pool.to_string(),
                limit: IntGauge::with_opts(opts("limit", "Maximum number of items"))?,
                index: IntGauge::with_opts(opts("items", "Items that currently exist"))?,
                idle: IntGauge::with_opts(opts("idle", "Idle items"))?,
                create_in_progress: IntGauge::with_opts(opts(
                    "create_in_progress",
                    "Creations in flight",
                ))?,
                waiting: IntGauge::with_opts(opts("waiting", "Callers in the wait queue"))?,
                tries: IntCounter::with_opts(opts("tries_total", "Acquire-and-run attempts"))?,
                try_errors: IntCounter::with_opts(opts("try_errors_total", "Failed attempts"))?,
                withs: IntCounter::with_opts(opts("with_total", "Retrying execute calls"))?,
                with_errors: IntCounter::with_opts(opts(
                    "with_errors_total",
                    "Retrying execute calls that failed",
                ))?,
                with_attempts: IntCounter::with_opts(opts(
                    "with_attempts_total",
                    "Attempts made by retrying execute calls",
                ))?,
                closes: IntCounter::with_opts(opts("closes_total", "Pool close calls"))?,
            })
        }

        /// Register every series with `registry`
        pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
            registry.register(Box::new(self.limit.clone()))?;
            registry.register(Box::new(self.index.clone()))?;
            registry.register(Box::new(self.idle.clone()))?;
            registry.register(Box::new(self.create_in_progress.clone()))?;
            registry.register(Box::new(self.waiting.clone()))?;
            registry.register(Box::new(self.tries.clone()))?;
            registry.register(Box::new(self.try_errors.clone()))?;
            registry.register(Box::new(self.withs.clone()))?;
            registry.register(Box::new(self.with_errors.clone()))?;
            registry.register(Box::new(self.with_attempts.clone()))?;
            registry.register(Box::new(self.closes.clone()))?;
            Ok(())
        }
    }

    impl fmt::Debug for PrometheusTrace {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("PrometheusTrace")
                .field("pool", &self.pool)
                .finish_non_exhaustive()
        }
    }

    impl PoolTrace for PrometheusTrace {
        fn on_new(&self, info: NewInfo) {
            self.limit.set(info.limit as i64);
        }

        fn on_try(&self, info: TryDoneInfo<'_>) {
            self.tries.inc();
            if info.error.is_some() {
                self.try_errors.inc();
            }
        }

        fn on_with(&self, info: WithDoneInfo<'_>) {
            self.withs.inc();
            self.with_attempts.inc_by(info.attempts as u64);
            if info.error.is_some() {
                self.with_errors.inc();
            }
        }

        fn on_close(&self, _info: CloseDoneInfo<'_>) {
            self.closes.inc();
        }

        fn on_change(&self, info: ChangeInfo) {
            self.limit.set(info.limit as i64);
            self.index.set(info.index as i64);
            self.idle.set(info.idle as i64);
            self.create_in_progress.set(info.create_in_progress as i64);
            self.waiting.set(info.waiting as i64);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_prometheus_trace_tracks_changes() {
            let registry = Registry::new();
            let trace = PrometheusTrace::new("main").unwrap();
            trace.register(&registry).unwrap();

            trace.on_new(NewInfo { limit: 8 });
            trace.on_change(ChangeInfo {
                limit: 8,
                index: 3,
                idle: 2,
                create_in_progress: 1,
                waiting: 0,
            });
            trace.on_with(WithDoneInfo {
                attempts: 3,
                latency: std::time::Duration::ZERO,
                error: None,
            });

            let families = registry.gather();
            let value = |name: &str| {
                families
                    .iter()
                    .find(|family| family.get_name() == name)
                    .map(|family| {
                        let metric = &family.get_metric()[0];
                        if metric.has_gauge() {
                            metric.get_gauge().get_value()
                        } else {
                            metric.get_counter().get_value()
                        }
                    })
                    .unwrap()
            };

            assert_eq!(value("sessionpool_limit"), 8.0);
            assert_eq!(value("sessionpool_items"), 3.0);
            assert_eq!(value("sessionpool_idle"), 2.0);
            assert_eq!(value("sessionpool_with_attempts_total"), 3.0);
        }

        #[test]
        fn test_double_register_fails() {
            let registry = Registry::new();
            let trace = PrometheusTrace::new("main").unwrap();
            trace.register(&registry).unwrap();
            assert!(trace.register(&registry).is_err());
        }
    }
}
