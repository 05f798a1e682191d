use anyhow::{anyhow, Result};
use async_trait::async_trait;
use elasticsearch::{http::request::JsonBody, BulkParts, Elasticsearch, IndexParts};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument};

#[async_trait]
pub trait SearchIndex: Send + Sync {
  async fn upsert_many(&self, docs: Vec<(String, Value)>) -> Result<()>;
  async fn delete_many(&self, ids: Vec<String>) -> Result<()>;
}

pub struct ElasticsearchSearchIndex {
  client: Arc<Elasticsearch>,
  index_name: String,
}

impl ElasticsearchSearchIndex {
  pub fn new(client: Arc<Elasticsearch>, index_name: String) -> Self {
    Self { client, index_name }
  }

  #[instrument(skip(self))]
  pub async fn setup(&self) -> Result<()> {
    let body = json!({
      "settings": {
        "number_of_shards": 1,
        "number_of_replicas": 0,
      },
      "mappings": {
        "dynamic_templates": [
          {
            "id_fields": {
              "match_mapping_type": "string",
              "match": "*_id",
              "mapping": {
                "type": "keyword"
              }
            }
          }
        ]
      },
    });
    let response = self
      .client
      .index(IndexParts::Index(self.index_name.as_str()))
      .body(body)
      .send()
      .await?;
    let response = response.json::<Value>().await?;
    info!("Search index created: {:?}", response);
    Ok(())
  }

  async fn bulk(&self, body: Vec<JsonBody<Value>>) -> Result<()> {
    let response = self
      .client
      .bulk(BulkParts::Index(self.index_name.as_str()))
      .body(body)
      .send()
      .await?
      .json::<Value>()
      .await?;
    if response["errors"].as_bool().unwrap_or(false) {
      return Err(anyhow!("Bulk indexing reported errors: {}", response));
    }
    Ok(())
  }
}

#[async_trait]
impl SearchIndex for ElasticsearchSearchIndex {
  #[instrument(skip_all, fields(count = docs.len()))]
  async fn upsert_many(&self, docs: Vec<(String, Value)>) -> Result<()> {
    if docs.is_empty() {
      return Ok(());
    }
    let body = docs
      .into_iter()
      .flat_map(|(id, doc)| {
        vec![
          json!({"update": {"_id": id}}).into(),
          json!({"doc": doc, "doc_as_upsert": true}).into(),
        ]
      })
      .collect::<Vec<JsonBody<Value>>>();
    self.bulk(body).await
  }

  #[instrument(skip_all, fields(count = ids.len()))]
  async fn delete_many(&self, ids: Vec<String>) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }
    let body = ids
      .into_iter()
      .map(|id| json!({"delete": {"_id": id}}).into())
      .collect::<Vec<JsonBody<Value>>>();
    self.bulk(body).await
  }
}
