//! Controller settings, read from flags or environment

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use kube::Client;

use affinity_common::kube_utils::create_client;
use affinity_common::telemetry::{TelemetryConfig, DEFAULT_METRICS_INTERVAL};
use affinity_common::Error;

use crate::reconciler::{ReconcilerConfig, DEFAULT_MIN_PLATFORM_MAJOR};

/// Settings of the affinity group controller
///
/// Meant to be flattened into the embedding binary's command line.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Seconds between periodic resyncs of every InfraCluster
    #[arg(long, env = "AFFINITY_RESYNC_SECS", default_value = "300")]
    pub resync_secs: u64,

    /// Seconds before a failed reconciliation is retried
    #[arg(long, env = "AFFINITY_ERROR_REQUEUE_SECS", default_value = "5")]
    pub error_requeue_secs: u64,

    /// Timeout in seconds for each platform call and owner listing
    #[arg(long, env = "AFFINITY_CALL_TIMEOUT_SECS", default_value = "30")]
    pub call_timeout_secs: u64,

    /// Minimum platform major version that supports affinity groups
    #[arg(long, env = "AFFINITY_MIN_PLATFORM_MAJOR", default_value_t = DEFAULT_MIN_PLATFORM_MAJOR)]
    pub min_platform_major: u64,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "AFFINITY_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Path to a kubeconfig (in-cluster config when unset)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// OTLP gRPC endpoint for reconcile spans and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Seconds between metric exports to the OTLP endpoint
    #[arg(long, env = "AFFINITY_METRICS_INTERVAL_SECS", default_value_t = DEFAULT_METRICS_INTERVAL.as_secs())]
    pub metrics_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_secs: 300,
            error_requeue_secs: 5,
            call_timeout_secs: 30,
            min_platform_major: DEFAULT_MIN_PLATFORM_MAJOR,
            watch_namespace: None,
            kubeconfig: None,
            otlp_endpoint: None,
            metrics_interval_secs: DEFAULT_METRICS_INTERVAL.as_secs(),
        }
    }
}

impl ControllerConfig {
    /// Interval of the periodic resync
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    /// Delay before retrying a failed reconciliation
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    /// Settings of the binding reconciler
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            min_platform_major: self.min_platform_major,
        }
    }

    /// Telemetry settings for [`affinity_common::telemetry::init_telemetry`]
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            otlp_endpoint: self.otlp_endpoint.clone(),
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
            ..TelemetryConfig::default()
        }
    }

    /// Kube client for the configured kubeconfig
    pub async fn client(&self) -> Result<Client, Error> {
        create_client(self.kubeconfig.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        controller: ControllerConfig,
    }

    #[test]
    fn defaults_match_clap_defaults() {
        let cli = Cli::try_parse_from(["affinity"]).unwrap();
        let defaults = ControllerConfig::default();

        assert_eq!(cli.controller.resync_secs, defaults.resync_secs);
        assert_eq!(cli.controller.error_requeue_secs, defaults.error_requeue_secs);
        assert_eq!(cli.controller.call_timeout_secs, defaults.call_timeout_secs);
        assert_eq!(cli.controller.min_platform_major, 7);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "affinity",
            "--call-timeout-secs",
            "10",
            "--min-platform-major",
            "8",
            "--watch-namespace",
            "tenants",
        ])
        .unwrap();

        let reconciler = cli.controller.reconciler();
        assert_eq!(reconciler.call_timeout, Duration::from_secs(10));
        assert_eq!(reconciler.min_platform_major, 8);
        assert_eq!(cli.controller.watch_namespace.as_deref(), Some("tenants"));
    }

    #[test]
    fn telemetry_follows_flags() {
        let cli = Cli::try_parse_from([
            "affinity",
            "--otlp-endpoint",
            "http://otel-collector:4317",
            "--metrics-interval-secs",
            "10",
        ])
        .unwrap();

        let telemetry = cli.controller.telemetry();
        assert_eq!(
            telemetry.otlp_endpoint.as_deref(),
            Some("http://otel-collector:4317")
        );
        assert_eq!(telemetry.metrics_interval, Duration::from_secs(10));
        assert_eq!(telemetry.service_name, "affinity-controller");
    }

    #[test]
    fn durations() {
        let config = ControllerConfig::default();
        assert_eq!(config.resync_interval(), Duration::from_secs(300));
        assert_eq!(config.error_requeue(), Duration::from_secs(5));
    }
}
