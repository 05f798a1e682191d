use super::{
  job::{QueueName, QueueStats},
  queue_repository::{EnqueueJob, QueueRepository},
};
use anyhow::Result;
use derive_builder::Builder;
use serde::Serialize;
use std::{marker::PhantomData, sync::Arc, time::Duration};

/// Process-wide per-queue configuration. One logical queue, one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct QueueDescriptor {
  pub name: QueueName,
  pub default_max_retries: u32,
  pub keep_failed: bool,
  pub retain_completed: bool,
  pub timeout: Duration,
}

pub fn descriptor(name: QueueName) -> QueueDescriptor {
  let (default_max_retries, keep_failed, retain_completed, timeout_seconds) = match name {
    QueueName::Crawl => (2, true, false, 120),
    QueueName::Tag => (2, true, false, 60),
    QueueName::Summarize => (2, true, false, 60),
    QueueName::SearchIndex => (5, false, false, 30),
    QueueName::AssetPreprocessing => (2, true, false, 300),
    QueueName::Video => (2, true, false, 1800),
    QueueName::Webhook => (3, false, false, 30),
    QueueName::RuleEngine => (2, false, false, 30),
    QueueName::AssetDeletion => (4, false, false, 60),
  };
  QueueDescriptor {
    name,
    default_max_retries,
    keep_failed,
    retain_completed,
    timeout: Duration::from_secs(timeout_seconds),
  }
}

#[derive(Debug, Clone, Default, Builder)]
#[builder(default, setter(strip_option, into))]
pub struct EnqueueParameters {
  pub priority: u32,
  pub group_id: Option<String>,
  pub idempotency_key: Option<String>,
  pub delay: Option<Duration>,
  pub max_retries: Option<u32>,
}

/// Typed handle over one queue; payloads are serialized on enqueue and
/// deserialized back in the runner's handler.
pub struct JobQueue<P> {
  repository: Arc<QueueRepository>,
  descriptor: QueueDescriptor,
  _payload: PhantomData<fn(P)>,
}

impl<P> Clone for JobQueue<P> {
  fn clone(&self) -> Self {
    Self {
      repository: Arc::clone(&self.repository),
      descriptor: self.descriptor,
      _payload: PhantomData,
    }
  }
}

impl<P: Serialize> JobQueue<P> {
  pub fn new(repository: Arc<QueueRepository>, name: QueueName) -> Self {
    Self {
      repository,
      descriptor: descriptor(name),
      _payload: PhantomData,
    }
  }

  pub fn name(&self) -> QueueName {
    self.descriptor.name
  }

  pub async fn enqueue(&self, payload: &P, params: EnqueueParameters) -> Result<String> {
    self
      .repository
      .enqueue(EnqueueJob {
        queue: self.descriptor.name,
        payload: serde_json::to_vec(payload)?,
        priority: params.priority,
        group_id: params.group_id,
        idempotency_key: params.idempotency_key,
        max_retries: params
          .max_retries
          .unwrap_or(self.descriptor.default_max_retries),
        delay: params.delay,
      })
      .await
  }

  pub async fn stats(&self) -> Result<QueueStats> {
    self.repository.stats(self.descriptor.name).await
  }

  pub async fn depth(&self) -> Result<u64> {
    self.repository.depth(self.descriptor.name).await
  }
}
