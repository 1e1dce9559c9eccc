//! Logging and OTLP export for the affinity group controller
//!
//! Logs are JSON lines filtered by `RUST_LOG`. When an OTLP endpoint is
//! configured, reconcile spans and the instruments in [`crate::metrics`] are
//! exported to it as well.

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,affinity=debug,kube=info,tower=warn,hyper=warn";

/// Default interval between metric exports
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to build the span exporter
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to build the metric exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber is already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans and metrics
    pub service_name: String,

    /// OTLP gRPC endpoint (e.g., "http://otel-collector:4317")
    ///
    /// When None, spans and events are only logged locally.
    pub otlp_endpoint: Option<String>,

    /// How often reconcile metrics are pushed to the endpoint
    pub metrics_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "affinity-controller".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }
}

/// Exporters installed by [`init_telemetry`]
///
/// Call [`TelemetryGuard::shutdown`] before exit so the last reconcile spans
/// and metric points are flushed.
#[must_use = "dropping the guard skips the final flush"]
pub struct TelemetryGuard {
    exporters: Option<(TracerProvider, SdkMeterProvider)>,
}

impl TelemetryGuard {
    /// True when spans and metrics are exported over OTLP
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    /// Flush and stop the OTLP exporters
    pub fn shutdown(self) {
        let Some((tracer, meter)) = self.exporters else {
            return;
        };
        if let Err(e) = tracer.shutdown() {
            tracing::warn!(error = %e, "failed to flush spans");
        }
        if let Err(e) = meter.shutdown() {
            tracing::warn!(error = %e, "failed to flush metrics");
        }
    }
}

/// Install the global subscriber and, when configured, the OTLP exporters
///
/// ```ignore
/// use affinity_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// let telemetry = init_telemetry(TelemetryConfig::default())?;
/// // run controllers
/// telemetry.shutdown();
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporters = match &config.otlp_endpoint {
        Some(endpoint) => Some(install_otlp(endpoint, &config)?),
        None => None,
    };
    let otel_layer = exporters.as_ref().map(|(tracer, _)| {
        tracing_opentelemetry::layer().with_tracer(tracer.tracer(config.service_name.clone()))
    });

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("none"),
        metrics_interval_secs = config.metrics_interval.as_secs(),
        "telemetry initialized"
    );
    Ok(TelemetryGuard { exporters })
}

/// Build the resource attached to every exported span and metric
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];

    // Downward API
    for (env, key) in [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
    ] {
        if let Ok(value) = std::env::var(env) {
            attributes.push(KeyValue::new(key, value));
        }
    }

    Resource::new(attributes)
}

/// Register span and metric exporters for one endpoint as the global providers
fn install_otlp(
    endpoint: &str,
    config: &TelemetryConfig,
) -> Result<(TracerProvider, SdkMeterProvider), TelemetryError> {
    let resource = build_resource(&config.service_name);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let tracer = TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_resource(resource.clone())
        .build();

    let reader = PeriodicReader::builder(metric_exporter, runtime::Tokio)
        .with_interval(config.metrics_interval)
        .build();
    let meter = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(tracer.clone());
    global::set_meter_provider(meter.clone());

    Ok((tracer, meter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_names_the_controller() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "affinity-controller");
        assert_eq!(config.metrics_interval, DEFAULT_METRICS_INTERVAL);
    }

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn resource_carries_service_name_and_version() {
        let resource = build_resource("test-service");
        assert_eq!(
            resource
                .get(opentelemetry_semantic_conventions::resource::SERVICE_NAME.into())
                .map(|v| v.to_string()),
            Some("test-service".to_string())
        );
        assert!(resource
            .get(opentelemetry_semantic_conventions::resource::SERVICE_VERSION.into())
            .is_some());
    }

    #[test]
    fn guard_without_endpoint_is_not_exporting() {
        let guard = TelemetryGuard { exporters: None };
        assert!(!guard.is_exporting());
        guard.shutdown();
    }
}
