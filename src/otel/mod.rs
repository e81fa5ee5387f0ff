//! OpenTelemetry integration for session-steward
//!
//! This module provides tracing and metrics export to OTLP endpoints, the
//! domain [`Metrics`] fed from component events, and the tracing subscriber
//! setup.

use crate::config::{LoggingConfig, OtelConfig};
use crate::events::{QueueEvent, SchedulerEvent, StabilizerEvent};
use crate::models::Alert;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// OpenTelemetry provider
///
/// Owns the tracer and meter providers. Without an OTLP endpoint the meter
/// provider has no reader and metrics go nowhere.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl OtelProvider {
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        let (tracer_provider, meter_provider) = if config.enabled {
            let endpoint = config.endpoint.as_ref().ok_or_else(|| {
                OtelError::Config("OTLP endpoint is required when enabled".into())
            })?;

            let tracer_provider = Self::init_tracer_provider(endpoint, &resource)?;
            let meter_provider = Self::init_meter_provider(endpoint, &resource)?;
            (Some(tracer_provider), meter_provider)
        } else {
            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            (None, meter_provider)
        };

        if let Some(ref tp) = tracer_provider {
            global::set_tracer_provider(tp.clone());
        }

        Ok(Self {
            tracer_provider,
            meter_provider,
            config: config.clone(),
        })
    }

    fn init_tracer_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<TracerProvider, OtelError> {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::runtime;
        use opentelemetry_sdk::trace::{Config, Sampler};

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;

        let trace_config = Config::default()
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource.clone());

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(trace_config)
            .build())
    }

    fn init_meter_provider(
        endpoint: &str,
        resource: &Resource,
    ) -> Result<SdkMeterProvider, OtelError> {
        use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
        use opentelemetry_sdk::metrics::reader::{
            DefaultAggregationSelector, DefaultTemporalitySelector,
        };
        use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

        let exporter = MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|e| OtelError::MeterInit(e.to_string()))?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

        Ok(SdkMeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader)
            .build())
    }

    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match self.tracer_provider {
            Some(ref tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Flush spans and shut the meter provider down
    pub fn shutdown(&self) -> Result<(), OtelError> {
        if let Err(e) = self.meter_provider.shutdown() {
            return Err(OtelError::Shutdown(format!(
                "Meter shutdown failed: {:?}",
                e
            )));
        }

        if let Some(ref tp) = self.tracer_provider {
            for result in tp.force_flush() {
                if let Err(e) = result {
                    return Err(OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)));
                }
            }
        }

        Ok(())
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Session metrics, recorded from component events
pub struct Metrics {
    /// Messages accepted into the delivery queue
    pub messages_enqueued_total: Counter<u64>,

    /// Successful transport sends
    pub messages_sent_total: Counter<u64>,

    /// Messages confirmed delivered (explicitly or by timeout)
    pub messages_delivered_total: Counter<u64>,

    /// Messages that failed permanently
    pub messages_failed_total: Counter<u64>,

    /// Send attempts that failed and will be retried
    pub message_retries_total: Counter<u64>,

    /// Processing passes deferred by the compliance guard
    pub sends_throttled_total: Counter<u64>,

    /// Completed sync runs by kind and outcome
    pub sync_runs_total: Counter<u64>,

    /// Sync run duration in seconds
    pub sync_duration: Histogram<f64>,

    /// Reconnect attempts started
    pub reconnect_attempts_total: Counter<u64>,

    /// Disconnects by reason
    pub disconnects_total: Counter<u64>,

    /// Alerts raised by type and severity
    pub alerts_raised_total: Counter<u64>,
}

impl Metrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            messages_enqueued_total: meter
                .u64_counter("session_steward_messages_enqueued_total")
                .with_description("Messages accepted into the delivery queue")
                .init(),
            messages_sent_total: meter
                .u64_counter("session_steward_messages_sent_total")
                .with_description("Successful transport sends")
                .init(),
            messages_delivered_total: meter
                .u64_counter("session_steward_messages_delivered_total")
                .with_description("Messages confirmed delivered")
                .init(),
            messages_failed_total: meter
                .u64_counter("session_steward_messages_failed_total")
                .with_description("Messages that failed permanently")
                .init(),
            message_retries_total: meter
                .u64_counter("session_steward_message_retries_total")
                .with_description("Failed send attempts scheduled for retry")
                .init(),
            sends_throttled_total: meter
                .u64_counter("session_steward_sends_throttled_total")
                .with_description("Send passes deferred by rate limits")
                .init(),
            sync_runs_total: meter
                .u64_counter("session_steward_sync_runs_total")
                .with_description("Completed sync runs")
                .init(),
            sync_duration: meter
                .f64_histogram("session_steward_sync_duration_seconds")
                .with_description("Sync run duration in seconds")
                .init(),
            reconnect_attempts_total: meter
                .u64_counter("session_steward_reconnect_attempts_total")
                .with_description("Reconnect attempts started")
                .init(),
            disconnects_total: meter
                .u64_counter("session_steward_disconnects_total")
                .with_description("Transport disconnects")
                .init(),
            alerts_raised_total: meter
                .u64_counter("session_steward_alerts_raised_total")
                .with_description("Alerts raised by the sync monitor")
                .init(),
        }
    }

    pub fn record_queue_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Enqueued { priority, .. } => self
                .messages_enqueued_total
                .add(1, &[KeyValue::new("priority", priority.as_str())]),
            QueueEvent::Sent { .. } => self.messages_sent_total.add(1, &[]),
            QueueEvent::Delivered { synthesized, .. } => self
                .messages_delivered_total
                .add(1, &[KeyValue::new("synthesized", *synthesized)]),
            QueueEvent::Failed { .. } => self.messages_failed_total.add(1, &[]),
            QueueEvent::RetryScheduled { .. } => self.message_retries_total.add(1, &[]),
            QueueEvent::Throttled { .. } => self.sends_throttled_total.add(1, &[]),
            QueueEvent::Read { .. } | QueueEvent::Cancelled { .. } => {}
        }
    }

    pub fn record_scheduler_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::SyncCompleted { kind, duration, .. } => {
                let attrs = [
                    KeyValue::new("kind", kind.as_str()),
                    KeyValue::new("outcome", "success"),
                ];
                self.sync_runs_total.add(1, &attrs);
                self.sync_duration.record(duration.as_secs_f64(), &attrs[..1]);
            }
            SchedulerEvent::SyncFailed { kind, duration, .. } => {
                let attrs = [
                    KeyValue::new("kind", kind.as_str()),
                    KeyValue::new("outcome", "failure"),
                ];
                self.sync_runs_total.add(1, &attrs);
                self.sync_duration.record(duration.as_secs_f64(), &attrs[..1]);
            }
            _ => {}
        }
    }

    pub fn record_alert(&self, alert: &Alert) {
        self.alerts_raised_total.add(
            1,
            &[
                KeyValue::new("type", alert.alert_type.to_string()),
                KeyValue::new("severity", format!("{:?}", alert.severity).to_lowercase()),
            ],
        );
    }

    pub fn record_stabilizer_event(&self, event: &StabilizerEvent) {
        match event {
            StabilizerEvent::ReconnectAttempt { .. } => self.reconnect_attempts_total.add(1, &[]),
            StabilizerEvent::Disconnected { reason, .. } => self
                .disconnects_total
                .add(1, &[KeyValue::new("reason", reason.to_string())]),
            _ => {}
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level. The format is `json` or
/// `pretty`; the OpenTelemetry layer is added when export is enabled.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| OtelError::Config(e.to_string()))?;

    let json = logging.format.eq_ignore_ascii_case("json");
    let fmt_json = json.then(|| tracing_subscriber::fmt::layer().json());
    let fmt_pretty = (!json).then(tracing_subscriber::fmt::layer);
    let otel_layer = otel
        .is_enabled()
        .then(|| tracing_opentelemetry::layer().with_tracer(otel.tracer("session-steward")));

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(fmt_json)
        .with(fmt_pretty)
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}
