//! Relay metrics exported through OpenTelemetry.
//!
//! [`RedeemMetrics`] records one data point set per processed attempt:
//! how long the attempt took, its outcome, and for finished relays the
//! end-to-end duration plus the transferred amount and gas economics.
//! Every point is labelled with the target chain.
//!
//! Instruments come from the global meter provider. Without
//! [`MetricsConfig::setup_metrics`] that provider is a no-op, so the
//! relayer runs the same with or without an export endpoint.
//!
//! The meter provider uses a [`PeriodicReader`] which exports from a
//! background thread outside the tokio runtime, so the OTLP exporter is
//! given a blocking HTTP client built on a separate thread.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{ExporterBuildError, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;
use url::Url;

use crate::relay::{Relay, RelayStatus};

pub const METER_NAME: &str = "cctp-relayer";

/// Histogram buckets for relay durations, 10 seconds to one hour.
const DURATION_BOUNDARIES_SECS: [f64; 9] = [
    10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1800.0, 3600.0,
];

#[derive(Clone)]
pub struct RedeemMetrics {
    processing_duration: Histogram<f64>,
    total_duration: Histogram<f64>,
    outcomes: Counter<u64>,
    amount_transferred: Histogram<f64>,
    gas_used: Histogram<u64>,
    relay_cost: Histogram<f64>,
}

impl RedeemMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            processing_duration: meter
                .f64_histogram("relay.processing.duration")
                .with_unit("s")
                .with_description("Time spent in one processing attempt")
                .with_boundaries(DURATION_BOUNDARIES_SECS.to_vec())
                .build(),
            total_duration: meter
                .f64_histogram("relay.total.duration")
                .with_unit("s")
                .with_description("Time from first observation to redeemed or failed")
                .with_boundaries(DURATION_BOUNDARIES_SECS.to_vec())
                .build(),
            outcomes: meter
                .u64_counter("relay.outcomes")
                .with_description("Processing attempts by resulting relay status")
                .build(),
            amount_transferred: meter
                .f64_histogram("relay.amount_transferred")
                .with_unit("USDC")
                .build(),
            gas_used: meter.u64_histogram("relay.gas_used").build(),
            relay_cost: meter
                .f64_histogram("relay.cost")
                .with_description("Native token spent on the redemption transaction")
                .build(),
        }
    }

    /// Instruments on the global meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(METER_NAME))
    }

    /// Records one processing attempt of `relay`, which carries the
    /// status the attempt left it in.
    pub fn record(&self, relay: &Relay, processing: Duration) {
        let target_chain = KeyValue::new(
            "target_chain",
            relay
                .to_chain
                .map_or_else(|| "unknown".to_owned(), |chain| chain.to_string()),
        );
        let chain_only = [target_chain.clone()];
        let with_status = [
            target_chain,
            KeyValue::new("status", relay.status.as_str()),
        ];

        self.processing_duration
            .record(processing.as_secs_f64(), &with_status);
        self.outcomes.add(1, &with_status);

        let finished_at = match relay.status {
            RelayStatus::Redeemed => relay.completed_at,
            RelayStatus::Failed => relay.failed_at,
            RelayStatus::Waiting | RelayStatus::Active => return,
        };
        let elapsed = finished_at.unwrap_or_else(Utc::now) - relay.received_at;
        if let Ok(elapsed) = elapsed.to_std() {
            self.total_duration
                .record(elapsed.as_secs_f64(), &with_status);
        }

        if relay.status != RelayStatus::Redeemed {
            return;
        }

        if let Some(amount) = relay.amount_transferred.and_then(|amount| amount.to_f64()) {
            self.amount_transferred.record(amount, &chain_only);
        }
        if let Some(gas_used) = relay.gas_used {
            self.gas_used.record(gas_used, &chain_only);
        }
        if let Some(cost) = relay.relay_cost.and_then(|cost| cost.to_f64()) {
            self.relay_cost.record(cost, &chain_only);
        }
    }
}

/// OTLP metrics export settings.
#[derive(Clone)]
pub struct MetricsConfig {
    pub(crate) endpoint: Url,
    pub(crate) service_name: String,
    pub(crate) export_interval: Duration,
    pub(crate) api_key: Option<String>,
}

impl std::fmt::Debug for MetricsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("service_name", &self.service_name)
            .field("export_interval", &self.export_interval)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl MetricsConfig {
    /// Installs a global meter provider exporting to the OTLP endpoint.
    pub fn setup_metrics(&self) -> Result<MetricsGuard, MetricsError> {
        let headers: HashMap<String, String> = self
            .api_key
            .iter()
            .map(|key| ("authorization".to_owned(), key.clone()))
            .collect();

        let http_client = std::thread::spawn(|| {
            reqwest::blocking::Client::builder()
                .build()
                .map_err(|e| format!("Failed to build HTTP client: {e}"))
        })
        .join()
        .map_err(|_| MetricsError::ThreadSpawn)?
        .map_err(MetricsError::HttpClient)?;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_http_client(http_client)
            .with_endpoint(self.endpoint.as_str())
            .with_headers(headers)
            .build()?;

        let reader = PeriodicReader::builder(exporter)
            .with_interval(self.export_interval)
            .build();

        let meter_provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(
                Resource::builder()
                    .with_service_name(self.service_name.clone())
                    .build(),
            )
            .build();

        global::set_meter_provider(meter_provider.clone());

        Ok(MetricsGuard { meter_provider })
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to build OTLP exporter")]
    OtlpExporter(#[from] ExporterBuildError),
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
    #[error("Failed to spawn HTTP client thread")]
    ThreadSpawn,
}

/// Flushes pending metrics and stops the exporter on drop.
pub struct MetricsGuard {
    meter_provider: SdkMeterProvider,
}

impl Drop for MetricsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.force_flush() {
            eprintln!("Failed to flush metrics: {e:?}");
        }

        if let Err(e) = self.meter_provider.shutdown() {
            eprintln!("Failed to shutdown meter provider: {e:?}");
        }
    }
}
