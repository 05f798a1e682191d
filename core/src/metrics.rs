use opentelemetry::{
  global,
  metrics::{Counter, Gauge, Histogram},
  KeyValue,
};
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerOutcome {
  Completed,
  Failed,
  FailedPermanent,
}

/// Process-wide instrument handles. Cheap to clone; all instruments go
/// through the global meter provider wired up by telemetry init.
#[derive(Clone)]
pub struct AppMetrics {
  worker_stats: Counter<u64>,
  crawler_status_codes: Counter<u64>,
  crawl_latency: Histogram<f64>,
  import_processed: Counter<u64>,
  import_in_flight: Gauge<u64>,
  import_pending: Gauge<u64>,
  import_sessions_active: Gauge<u64>,
  import_batch_duration: Histogram<f64>,
  import_stale_resets: Counter<u64>,
}

impl AppMetrics {
  pub fn new() -> Self {
    let meter = global::meter("magpie");
    Self {
      worker_stats: meter.u64_counter("worker_stats").build(),
      crawler_status_codes: meter.u64_counter("crawler_status_codes_total").build(),
      crawl_latency: meter
        .f64_histogram("bookmark_crawl_latency_seconds")
        .build(),
      import_processed: meter.u64_counter("import_staging_processed_total").build(),
      import_in_flight: meter.u64_gauge("import_staging_in_flight").build(),
      import_pending: meter.u64_gauge("import_staging_pending_total").build(),
      import_sessions_active: meter.u64_gauge("import_sessions_active").build(),
      import_batch_duration: meter.f64_histogram("import_batch_duration_seconds").build(),
      import_stale_resets: meter.u64_counter("import_staging_stale_reset_total").build(),
    }
  }

  pub fn record_worker_outcome(&self, worker_name: &str, outcome: WorkerOutcome) {
    self.worker_stats.add(
      1,
      &[
        KeyValue::new("worker_name", worker_name.to_string()),
        KeyValue::new("status", outcome.to_string()),
      ],
    );
  }

  pub fn record_crawler_status_code(&self, status_code: u16) {
    self
      .crawler_status_codes
      .add(1, &[KeyValue::new("status_code", status_code as i64)]);
  }

  /// Creation-to-completion latency, recorded only for the first successful
  /// crawl of a user-initiated (priority 0) bookmark.
  pub fn record_crawl_latency(&self, seconds: f64) {
    self.crawl_latency.record(seconds, &[]);
  }

  pub fn record_import_result(&self, result: &str) {
    self
      .import_processed
      .add(1, &[KeyValue::new("result", result.to_string())]);
  }

  pub fn record_import_in_flight(&self, count: u64) {
    self.import_in_flight.record(count, &[]);
  }

  pub fn record_import_pending(&self, count: u64) {
    self.import_pending.record(count, &[]);
  }

  pub fn record_import_sessions_active(&self, status: &str, count: u64) {
    self
      .import_sessions_active
      .record(count, &[KeyValue::new("status", status.to_string())]);
  }

  pub fn record_import_batch_duration(&self, seconds: f64) {
    self.import_batch_duration.record(seconds, &[]);
  }

  pub fn record_import_stale_resets(&self, count: u64) {
    self.import_stale_resets.add(count, &[]);
  }
}

impl Default for AppMetrics {
  fn default() -> Self {
    Self::new()
  }
}
