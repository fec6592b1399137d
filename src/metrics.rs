//! Prometheus metrics for plugin lifecycles and run functions.

use prometheus::{Counter, Histogram, IntGauge, Registry};

use crate::error::{Error, Result};

/// Configuration for plugin metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin metrics.
    pub prefix: String,
    /// Whether to collect the activation duration histogram.
    pub detailed_timing: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "plugframe".to_string(),
            detailed_timing: true,
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable detailed timing.
    pub fn with_detailed_timing(mut self, enabled: bool) -> Self {
        self.detailed_timing = enabled;
        self
    }
}

/// Plugin metrics collector.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    activations: Counter,
    activation_failures: Counter,
    deactivations: Counter,
    stop_failures: Counter,
    run_calls: Counter,
    active: IntGauge,
    activation_duration: Histogram,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Metrics(e.to_string())
}

impl PluginMetrics {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter =
                Counter::new(format!("{}_{}", config.prefix, name), help).map_err(metric_error)?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(metric_error)?;
            Ok(counter)
        };

        let activations = counter("activations_total", "Total number of plugin activations")?;
        let activation_failures = counter(
            "activation_failures_total",
            "Total number of failed plugin activations",
        )?;
        let deactivations = counter("deactivations_total", "Total number of plugin deactivations")?;
        let stop_failures = counter(
            "stop_failures_total",
            "Total number of plugins that failed to stop cleanly",
        )?;
        let run_calls = counter("run_calls_total", "Total number of run function invocations")?;

        let active = IntGauge::new(
            format!("{}_active_plugins", config.prefix),
            "Number of active plugins",
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(active.clone()))
            .map_err(metric_error)?;

        let activation_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                format!("{}_activation_duration_seconds", config.prefix),
                "Plugin activation duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metric_error)?;
        registry
            .register(Box::new(activation_duration.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            config,
            registry,
            activations,
            activation_failures,
            deactivations,
            stop_failures,
            run_calls,
            active,
            activation_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a successful activation.
    pub fn record_activation(&self, duration_secs: f64) {
        self.activations.inc();
        self.active.inc();
        if self.config.detailed_timing {
            self.activation_duration.observe(duration_secs);
        }
    }

    /// Record a failed activation.
    pub fn record_activation_failure(&self) {
        self.activation_failures.inc();
    }

    /// Record a deactivation; `clean` is false when the plugin failed to
    /// stop cleanly.
    pub fn record_deactivation(&self, clean: bool) {
        self.deactivations.inc();
        self.active.dec();
        if !clean {
            self.stop_failures.inc();
        }
    }

    /// Record a run function invocation.
    pub fn record_run(&self) {
        self.run_calls.inc();
    }

    /// Total successful activations.
    pub fn activations_total(&self) -> u64 {
        self.activations.get() as u64
    }

    /// Total failed activations.
    pub fn activation_failures_total(&self) -> u64 {
        self.activation_failures.get() as u64
    }

    /// Total deactivations.
    pub fn deactivations_total(&self) -> u64 {
        self.deactivations.get() as u64
    }

    /// Total unclean stops.
    pub fn stop_failures_total(&self) -> u64 {
        self.stop_failures.get() as u64
    }

    /// Total run function invocations.
    pub fn run_calls_total(&self) -> u64 {
        self.run_calls.get() as u64
    }

    /// Currently active plugins.
    pub fn active_plugins(&self) -> i64 {
        self.active.get()
    }
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("activations", &self.activations_total())
            .field("deactivations", &self.deactivations_total())
            .field("active", &self.active_plugins())
            .finish()
    }
}
