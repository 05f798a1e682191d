use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
  logs::LoggerProvider,
  metrics::{PeriodicReader, SdkMeterProvider},
  propagation::TraceContextPropagator,
  runtime::Tokio,
  trace::TracerProvider,
  Resource,
};
use std::time::Duration;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, prelude::*, EnvFilter, Registry};

use crate::settings::TracingSettings;

const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Wires tracing, logs and metrics to the OTLP collector. Everything else in
/// the process talks to the `tracing` and `opentelemetry` globals this sets.
pub struct Telemetry;

impl Telemetry {
  pub fn init(config: &TracingSettings) -> Result<Self> {
    let resource = Resource::new(vec![
      KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        config.service_name.clone(),
      ),
      KeyValue::new(
        opentelemetry_semantic_conventions::attribute::HOST_NAME,
        config.host_name.clone(),
      ),
    ]);
    global::set_text_map_propagator(TraceContextPropagator::new());

    let span_exporter = SpanExporter::builder()
      .with_tonic()
      .with_endpoint(&config.otel_collector_endpoint)
      .build()?;
    let tracer_provider = TracerProvider::builder()
      .with_batch_exporter(span_exporter, Tokio)
      .with_resource(resource.clone())
      .build();
    let tracer = tracer_provider.tracer(format!("magpie/{}", config.service_name));
    global::set_tracer_provider(tracer_provider);

    let log_exporter = LogExporter::builder()
      .with_tonic()
      .with_endpoint(&config.otel_collector_endpoint)
      .build()?;
    let logger_provider = LoggerProvider::builder()
      .with_batch_exporter(log_exporter, Tokio)
      .with_resource(resource.clone())
      .build();

    let metric_exporter = MetricExporter::builder()
      .with_tonic()
      .with_endpoint(&config.otel_collector_endpoint)
      .build()?;
    let meter_provider = SdkMeterProvider::builder()
      .with_resource(resource)
      .with_reader(
        PeriodicReader::builder(metric_exporter, Tokio)
          .with_interval(METRIC_EXPORT_INTERVAL)
          .build(),
      )
      .build();
    global::set_meter_provider(meter_provider);

    let filter = EnvFilter::new("info")
      .add_directive("hyper=error".parse()?)
      .add_directive("h2=error".parse()?)
      .add_directive("tower=error".parse()?)
      .add_directive("reqwest=error".parse()?)
      .add_directive("chromiumoxide=warn".parse()?);
    Registry::default()
      .with(filter)
      .with(OpenTelemetryLayer::new(tracer).with_error_events_to_exceptions(true))
      .with(OpenTelemetryTracingBridge::new(&logger_provider))
      .init();

    Ok(Self)
  }

  pub fn shutdown(self) -> Result<()> {
    global::shutdown_tracer_provider();
    Ok(())
  }
}
