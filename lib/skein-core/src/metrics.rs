use metrics::{counter, gauge, Counter, Gauge, Label, Level, SharedString};

/// Builder for constructing metrics that share a set of default labels.
#[derive(Clone, Default)]
pub(crate) struct MetricsBuilder {
    default_labels: Vec<Label>,
}

impl MetricsBuilder {
    /// Adds a default label, included on every metric registered through this builder.
    pub fn add_default_label<V>(mut self, key: &'static str, value: V) -> Self
    where
        V: Into<SharedString>,
    {
        self.default_labels.push(Label::new(SharedString::const_str(key), value.into()));
        self
    }

    /// Registers a counter at debug verbosity.
    pub fn register_debug_counter(&self, metric_name: &'static str) -> Counter {
        let labels = self.default_labels.clone();
        counter!(level: Level::DEBUG, metric_name, labels)
    }

    /// Registers a gauge at debug verbosity.
    pub fn register_debug_gauge(&self, metric_name: &'static str) -> Gauge {
        let labels = self.default_labels.clone();
        gauge!(level: Level::DEBUG, metric_name, labels)
    }
}

/// Scheduler telemetry.
#[derive(Clone)]
pub(crate) struct SchedulerMetrics {
    pub jobs_queued: Counter,
    pub jobs_executed: Counter,
    pub job_panics: Counter,
    pub threads_spawned: Counter,
    pub threads_live: Gauge,
    pub exclusive_threads_live: Gauge,
    pub items_processed: Counter,
}

impl SchedulerMetrics {
    pub fn new(scheduler_name: &str) -> Self {
        let builder = MetricsBuilder::default().add_default_label("scheduler", scheduler_name.to_string());

        Self {
            jobs_queued: builder.register_debug_counter("scheduler_jobs_queued_total"),
            jobs_executed: builder.register_debug_counter("scheduler_jobs_executed_total"),
            job_panics: builder.register_debug_counter("scheduler_job_panics_total"),
            threads_spawned: builder.register_debug_counter("scheduler_threads_spawned_total"),
            threads_live: builder.register_debug_gauge("scheduler_threads_live"),
            exclusive_threads_live: builder.register_debug_gauge("scheduler_exclusive_threads_live"),
            items_processed: builder.register_debug_counter("process_items_processed_total"),
        }
    }
}
