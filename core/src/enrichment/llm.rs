use crate::settings::Settings;
use anyhow::{anyhow, Result};
use async_openai::{
  config::OpenAIConfig,
  error::OpenAIError,
  types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
  },
  Client,
};
use std::sync::Arc;
use tracing::{error, instrument};

const TAG_SYSTEM_PROMPT: &str = "You tag bookmarks for a personal archive. \
  Reply with a JSON array of 1 to 5 short lowercase tags and nothing else.";
const SUMMARY_SYSTEM_PROMPT: &str = "You summarize saved web pages. \
  Reply with a 2-3 sentence summary of the content and nothing else.";

/// Characters per token is roughly four; leave headroom for the prompt and
/// the completion.
fn content_budget_chars(context_length: u64) -> usize {
  (context_length.saturating_mul(3)) as usize
}

fn truncate_chars(content: &str, max_chars: usize) -> &str {
  match content.char_indices().nth(max_chars) {
    Some((idx, _)) => &content[..idx],
    None => content,
  }
}

/// Parses the model's tag reply, tolerating code fences and stray prose
/// around the JSON array.
fn parse_tags_reply(raw: &str) -> Result<Vec<String>> {
  let trimmed = raw.trim();
  let start = trimmed
    .find('[')
    .ok_or_else(|| anyhow!("No JSON array in tag reply"))?;
  let end = trimmed
    .rfind(']')
    .ok_or_else(|| anyhow!("No JSON array in tag reply"))?;
  let tags: Vec<String> = serde_json::from_str(&trimmed[start..=end])?;
  Ok(
    tags
      .into_iter()
      .map(|tag| tag.trim().to_lowercase())
      .filter(|tag| !tag.is_empty() && tag.len() <= 64)
      .take(5)
      .collect(),
  )
}

pub struct InferenceClient {
  client: Client<OpenAIConfig>,
  settings: Arc<Settings>,
}

impl InferenceClient {
  pub fn new(settings: Arc<Settings>) -> Self {
    let mut config = OpenAIConfig::default().with_api_key(&settings.inference.api_key);
    if let Some(api_base) = &settings.inference.api_base {
      config = config.with_api_base(api_base);
    }
    Self {
      client: Client::with_config(config),
      settings,
    }
  }

  async fn complete(&self, system: &str, user: String) -> Result<String> {
    let request = CreateChatCompletionRequestArgs::default()
      .model(&self.settings.inference.text_model)
      .messages(vec![
        ChatCompletionRequestSystemMessageArgs::default()
          .content(system)
          .build()?
          .into(),
        ChatCompletionRequestUserMessageArgs::default()
          .content(user)
          .build()?
          .into(),
      ])
      .build()?;
    let response = self
      .client
      .chat()
      .create(request)
      .await
      .inspect_err(|e| {
        if let OpenAIError::ApiError(err) = e {
          error!(
            code = err.code.as_ref().map(|c| c.to_string()).unwrap_or_default(),
            message = err.message.as_str(),
            "Inference API error"
          );
        }
      })?;
    response
      .choices
      .into_iter()
      .next()
      .and_then(|choice| choice.message.content)
      .ok_or_else(|| anyhow!("Inference reply had no content"))
  }

  #[instrument(skip_all)]
  pub async fn suggest_tags(
    &self,
    title: Option<&str>,
    content: &str,
    existing_tags: &[String],
  ) -> Result<Vec<String>> {
    let budget = content_budget_chars(self.settings.inference.context_length);
    let prompt = format!(
      "Title: {}\nExisting tags: {}\nContent:\n{}",
      title.unwrap_or("(untitled)"),
      existing_tags.join(", "),
      truncate_chars(content, budget),
    );
    let reply = self.complete(TAG_SYSTEM_PROMPT, prompt).await?;
    parse_tags_reply(&reply)
  }

  #[instrument(skip_all)]
  pub async fn summarize(&self, title: Option<&str>, content: &str) -> Result<String> {
    let budget = content_budget_chars(self.settings.inference.context_length);
    let prompt = format!(
      "Title: {}\nContent:\n{}",
      title.unwrap_or("(untitled)"),
      truncate_chars(content, budget),
    );
    let summary = self.complete(SUMMARY_SYSTEM_PROMPT, prompt).await?;
    Ok(summary.trim().to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_tags_reply_plain_array() -> Result<()> {
    assert_eq!(
      parse_tags_reply(r#"["Rust", " queues ", "crawling"]"#)?,
      vec!["rust", "queues", "crawling"]
    );
    Ok(())
  }

  #[test]
  fn test_parse_tags_reply_with_fences_and_prose() -> Result<()> {
    let reply = "Sure! Here are the tags:\n```json\n[\"birds\", \"hoarding\"]\n```";
    assert_eq!(parse_tags_reply(reply)?, vec!["birds", "hoarding"]);
    Ok(())
  }

  #[test]
  fn test_parse_tags_reply_caps_at_five() -> Result<()> {
    let reply = r#"["a","b","c","d","e","f","g"]"#;
    assert_eq!(parse_tags_reply(reply)?.len(), 5);
    Ok(())
  }

  #[test]
  fn test_parse_tags_reply_rejects_non_arrays() {
    assert!(parse_tags_reply("no tags here").is_err());
  }

  #[test]
  fn test_truncation_respects_char_boundaries() {
    let content = "héllo wörld";
    let truncated = truncate_chars(content, 6);
    assert_eq!(truncated, "héllo ");
  }
}
