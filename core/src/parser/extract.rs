use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
  pub title: Option<String>,
  pub description: Option<String>,
  pub image: Option<String>,
  pub logo: Option<String>,
  pub author: Option<String>,
  pub publisher: Option<String>,
  pub date_published: Option<String>,
  pub date_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadableContent {
  pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPage {
  pub metadata: PageMetadata,
  pub readable_content: Option<ReadableContent>,
}

fn attribute<'a>(tag: &'a tl::HTMLTag<'a>, name: &str) -> Option<String> {
  tag
    .attributes()
    .get(name)
    .flatten()
    .map(|value| value.as_utf8_str().trim().to_string())
    .filter(|value| !value.is_empty())
}

fn decode_text(raw: &str) -> String {
  htmlescape::decode_html(raw)
    .unwrap_or_else(|_| raw.to_string())
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
}

fn resolve_url(base: &Url, candidate: &str) -> Option<String> {
  base.join(candidate).ok().map(|resolved| resolved.to_string())
}

struct MetaTags {
  entries: Vec<(String, String)>,
}

impl MetaTags {
  fn collect(dom: &tl::VDom) -> Self {
    let parser = dom.parser();
    let mut entries = Vec::new();
    if let Some(tags) = dom.query_selector("meta") {
      for node in tags {
        let Some(tag) = node.get(parser).and_then(|node| node.as_tag()) else {
          continue;
        };
        let Some(content) = attribute(tag, "content") else {
          continue;
        };
        let key = attribute(tag, "property")
          .or_else(|| attribute(tag, "name"))
          .or_else(|| attribute(tag, "itemprop"));
        if let Some(key) = key {
          entries.push((key.to_ascii_lowercase(), decode_text(&content)));
        }
      }
    }
    Self { entries }
  }

  fn first(&self, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|wanted| {
      self
        .entries
        .iter()
        .find(|(key, _)| key == wanted)
        .map(|(_, content)| content.clone())
    })
  }
}

fn extract_title(dom: &tl::VDom, meta: &MetaTags) -> Option<String> {
  meta
    .first(&["og:title", "twitter:title"])
    .or_else(|| {
      dom
        .query_selector("title")
        .and_then(|mut nodes| nodes.next())
        .and_then(|node| node.get(dom.parser()))
        .map(|node| decode_text(&node.inner_text(dom.parser())))
        .filter(|title| !title.is_empty())
    })
}

fn extract_favicon(dom: &tl::VDom, base: &Url) -> Option<String> {
  let parser = dom.parser();
  if let Some(links) = dom.query_selector("link") {
    for node in links {
      let Some(tag) = node.get(parser).and_then(|node| node.as_tag()) else {
        continue;
      };
      let rel = attribute(tag, "rel").unwrap_or_default().to_ascii_lowercase();
      if rel.split_whitespace().any(|token| token == "icon") {
        if let Some(href) = attribute(tag, "href") {
          return resolve_url(base, &href);
        }
      }
    }
  }
  resolve_url(base, "/favicon.ico")
}

const READABLE_ROOTS: [&str; 4] = ["article", "main", "#content", "body"];
const READABLE_PARTS: [&str; 7] = ["h1", "h2", "h3", "p", "li", "blockquote", "pre"];
const MIN_PART_CHARS: usize = 3;

/// Readable-content pass: find the densest content root and keep its textual
/// building blocks, dropping script/nav/chrome by never selecting them.
fn extract_readable(dom: &tl::VDom, parser: &tl::Parser) -> Option<ReadableContent> {
  for root_selector in READABLE_ROOTS {
    let Some(root) = dom
      .query_selector(root_selector)
      .and_then(|mut nodes| nodes.next())
      .and_then(|node| node.get(parser))
      .and_then(|node| node.as_tag())
    else {
      continue;
    };

    let mut parts: Vec<String> = Vec::new();
    for part_selector in READABLE_PARTS {
      let Some(nodes) = root.query_selector(parser, part_selector) else {
        continue;
      };
      for node in nodes {
        let Some(tag) = node.get(parser).and_then(|node| node.as_tag()) else {
          continue;
        };
        let text = decode_text(&tag.inner_text(parser));
        if text.len() < MIN_PART_CHARS {
          continue;
        }
        let name = tag.name().as_utf8_str();
        parts.push(format!("<{name}>{}</{name}>", text));
      }
    }

    if !parts.is_empty() {
      return Some(ReadableContent {
        content: parts.join("\n"),
      });
    }
  }
  None
}

pub fn extract(html: &str, url: &str) -> Result<ExtractedPage> {
  let base = Url::parse(url).map_err(|e| anyhow!("Invalid url {}: {}", url, e))?;
  let dom = tl::parse(html, tl::ParserOptions::default())
    .map_err(|e| anyhow!("Failed to parse html: {}", e))?;
  let parser = dom.parser();
  let meta = MetaTags::collect(&dom);

  let image = meta
    .first(&["og:image", "og:image:url", "twitter:image"])
    .and_then(|candidate| resolve_url(&base, &candidate));

  let metadata = PageMetadata {
    title: extract_title(&dom, &meta),
    description: meta.first(&["og:description", "twitter:description", "description"]),
    image,
    logo: extract_favicon(&dom, &base),
    author: meta.first(&["author", "article:author", "twitter:creator"]),
    publisher: meta.first(&["og:site_name", "application-name", "publisher"]),
    date_published: meta.first(&["article:published_time", "datepublished", "date"]),
    date_modified: meta.first(&["article:modified_time", "datemodified", "og:updated_time"]),
  };
  let readable_content = extract_readable(&dom, parser);

  Ok(ExtractedPage {
    metadata,
    readable_content,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  const ARTICLE: &str = r#"<!doctype html>
    <html><head>
      <title>Fallback &amp; Title</title>
      <meta property="og:title" content="A Field Guide to Magpies" />
      <meta property="og:description" content="Corvids and their hoards" />
      <meta property="og:image" content="/images/banner.jpg" />
      <meta property="og:site_name" content="Bird Journal" />
      <meta name="author" content="J. Crow" />
      <meta property="article:published_time" content="2024-03-01T10:00:00Z" />
      <link rel="shortcut icon" href="/static/favicon.png" />
    </head><body>
      <nav><a href="/home">home</a></nav>
      <article>
        <h1>A Field Guide to Magpies</h1>
        <p>Magpies collect shiny things and store them away.</p>
        <p>They are famously clever birds.</p>
        <script>console.log("ignore me")</script>
      </article>
      <footer>about us</footer>
    </body></html>"#;

  #[test]
  fn test_extracts_metadata() -> Result<()> {
    let page = extract(ARTICLE, "https://birds.example/magpies")?;
    let metadata = page.metadata;
    assert_eq!(metadata.title.as_deref(), Some("A Field Guide to Magpies"));
    assert_eq!(metadata.description.as_deref(), Some("Corvids and their hoards"));
    assert_eq!(
      metadata.image.as_deref(),
      Some("https://birds.example/images/banner.jpg")
    );
    assert_eq!(
      metadata.logo.as_deref(),
      Some("https://birds.example/static/favicon.png")
    );
    assert_eq!(metadata.author.as_deref(), Some("J. Crow"));
    assert_eq!(metadata.publisher.as_deref(), Some("Bird Journal"));
    assert_eq!(
      metadata.date_published.as_deref(),
      Some("2024-03-01T10:00:00Z")
    );
    Ok(())
  }

  #[test]
  fn test_readable_content_prefers_article_and_skips_chrome() -> Result<()> {
    let page = extract(ARTICLE, "https://birds.example/magpies")?;
    let content = page.readable_content.unwrap().content;
    assert!(content.contains("<h1>A Field Guide to Magpies</h1>"));
    assert!(content.contains("Magpies collect shiny things"));
    assert!(!content.contains("home"), "nav content must not leak in");
    assert!(!content.contains("ignore me"), "script content must not leak in");
    Ok(())
  }

  #[test]
  fn test_title_falls_back_to_title_tag() -> Result<()> {
    let page = extract(
      "<html><head><title>Only &amp; Title</title></head><body><p>hello world</p></body></html>",
      "https://example.com/",
    )?;
    assert_eq!(page.metadata.title.as_deref(), Some("Only & Title"));
    assert!(page.readable_content.is_some());
    Ok(())
  }

  #[test]
  fn test_empty_page_has_no_readable_content() -> Result<()> {
    let page = extract("<html><body></body></html>", "https://example.com/")?;
    assert!(page.readable_content.is_none());
    assert_eq!(
      page.metadata.logo.as_deref(),
      Some("https://example.com/favicon.ico")
    );
    Ok(())
  }
}
