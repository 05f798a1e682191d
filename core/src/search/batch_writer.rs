use super::search_index::SearchIndex;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{
  spawn,
  sync::{mpsc, oneshot},
  time::{timeout_at, Instant},
};
use tracing::{debug, error};

const BATCH_WINDOW: Duration = Duration::from_millis(500);
const BATCH_LIMIT: usize = 50;

#[derive(Debug)]
pub enum IndexOp {
  Upsert { id: String, doc: Value },
  Delete { id: String },
}

impl IndexOp {
  fn same_kind(&self, other: &IndexOp) -> bool {
    matches!(
      (self, other),
      (IndexOp::Upsert { .. }, IndexOp::Upsert { .. })
        | (IndexOp::Delete { .. }, IndexOp::Delete { .. })
    )
  }
}

struct Submission {
  op: IndexOp,
  done: oneshot::Sender<Result<()>>,
}

/// Coalesces index writes over a short window to amortize round-trips to the
/// search engine. Batches are same-type in insertion order; every caller's
/// promise resolves with its batch's terminal result.
#[derive(Clone)]
pub struct BatchingIndexWriter {
  tx: mpsc::UnboundedSender<Submission>,
}

impl BatchingIndexWriter {
  pub fn new(index: Arc<dyn SearchIndex>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    spawn(run_batches(index, rx));
    Self { tx }
  }

  pub async fn submit(&self, op: IndexOp) -> Result<()> {
    let (done, result) = oneshot::channel();
    self
      .tx
      .send(Submission { op, done })
      .map_err(|_| anyhow!("Index writer is gone"))?;
    result.await.map_err(|_| anyhow!("Index writer dropped the batch"))?
  }
}

async fn run_batches(index: Arc<dyn SearchIndex>, mut rx: mpsc::UnboundedReceiver<Submission>) {
  let mut carried: Option<Submission> = None;
  loop {
    let first = match carried.take() {
      Some(submission) => submission,
      None => match rx.recv().await {
        Some(submission) => submission,
        None => return,
      },
    };

    let mut batch = vec![first];
    let deadline = Instant::now() + BATCH_WINDOW;
    while batch.len() < BATCH_LIMIT {
      match timeout_at(deadline, rx.recv()).await {
        Ok(Some(submission)) => {
          if submission.op.same_kind(&batch[0].op) {
            batch.push(submission);
          } else {
            // A kind switch seals the batch; order across kinds is kept.
            carried = Some(submission);
            break;
          }
        }
        Ok(None) => {
          flush(&index, batch).await;
          return;
        }
        Err(_) => break,
      }
    }
    flush(&index, batch).await;
  }
}

async fn flush(index: &Arc<dyn SearchIndex>, batch: Vec<Submission>) {
  debug!(count = batch.len(), "Flushing index batch");
  let mut dones = Vec::with_capacity(batch.len());
  let result = match &batch[0].op {
    IndexOp::Upsert { .. } => {
      let mut docs = Vec::with_capacity(batch.len());
      for submission in batch {
        if let IndexOp::Upsert { id, doc } = submission.op {
          docs.push((id, doc));
        }
        dones.push(submission.done);
      }
      index.upsert_many(docs).await
    }
    IndexOp::Delete { .. } => {
      let mut ids = Vec::with_capacity(batch.len());
      for submission in batch {
        if let IndexOp::Delete { id } = submission.op {
          ids.push(id);
        }
        dones.push(submission.done);
      }
      index.delete_many(ids).await
    }
  };

  let message = result.as_ref().err().map(|e| e.to_string());
  if let Some(message) = &message {
    error!(message = message.as_str(), "Index batch failed");
  }
  for done in dones {
    let outcome = match &message {
      None => Ok(()),
      Some(message) => Err(anyhow!("{}", message)),
    };
    let _ = done.send(outcome);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use serde_json::json;
  use tokio::sync::Mutex;

  #[derive(Default)]
  struct RecordingIndex {
    batches: Mutex<Vec<(String, usize)>>,
    fail_deletes: bool,
  }

  #[async_trait]
  impl SearchIndex for RecordingIndex {
    async fn upsert_many(&self, docs: Vec<(String, Value)>) -> Result<()> {
      self
        .batches
        .lock()
        .await
        .push(("upsert".to_string(), docs.len()));
      Ok(())
    }

    async fn delete_many(&self, ids: Vec<String>) -> Result<()> {
      self
        .batches
        .lock()
        .await
        .push(("delete".to_string(), ids.len()));
      if self.fail_deletes {
        return Err(anyhow!("engine refused"));
      }
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_same_kind_ops_coalesce_into_one_batch() -> Result<()> {
    let index = Arc::new(RecordingIndex::default());
    let writer = BatchingIndexWriter::new(Arc::clone(&index) as Arc<dyn SearchIndex>);

    let submissions = (0..5)
      .map(|i| {
        let writer = writer.clone();
        tokio::spawn(async move {
          writer
            .submit(IndexOp::Upsert {
              id: format!("doc-{i}"),
              doc: json!({"title": "t"}),
            })
            .await
        })
      })
      .collect::<Vec<_>>();
    for submission in submissions {
      submission.await??;
    }

    let batches = index.batches.lock().await;
    assert_eq!(batches.len(), 1, "five concurrent upserts make one batch");
    assert_eq!(batches[0], ("upsert".to_string(), 5));
    Ok(())
  }

  #[tokio::test]
  async fn test_kind_switch_seals_the_batch() -> Result<()> {
    let index = Arc::new(RecordingIndex::default());
    let writer = BatchingIndexWriter::new(Arc::clone(&index) as Arc<dyn SearchIndex>);

    let upsert = {
      let writer = writer.clone();
      tokio::spawn(async move {
        writer
          .submit(IndexOp::Upsert {
            id: "a".to_string(),
            doc: json!({}),
          })
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let delete = {
      let writer = writer.clone();
      tokio::spawn(
        async move { writer.submit(IndexOp::Delete { id: "b".to_string() }).await },
      )
    };
    upsert.await??;
    delete.await??;

    let batches = index.batches.lock().await;
    assert_eq!(
      *batches,
      vec![("upsert".to_string(), 1), ("delete".to_string(), 1)]
    );
    Ok(())
  }

  #[tokio::test]
  async fn test_engine_failure_resolves_every_caller() {
    let index = Arc::new(RecordingIndex {
      fail_deletes: true,
      ..Default::default()
    });
    let writer = BatchingIndexWriter::new(index as Arc<dyn SearchIndex>);

    let result = writer.submit(IndexOp::Delete { id: "x".to_string() }).await;
    assert!(result.is_err());
  }
}
