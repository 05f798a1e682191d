//! Readable-content extraction child. Runs with a capped heap so a
//! pathological page kills this process, not the worker. JSON request on
//! stdin, one JSON document on stdout, logs on stderr.

use magpie::parser::{
  bridge::{ParserFailureOutput, ParserRequest},
  extract::extract,
};
use std::io::{Read, Write};

fn apply_memory_limit(limit_mb: u64) {
  #[cfg(unix)]
  {
    let bytes = limit_mb * 1024 * 1024;
    let limit = libc::rlimit {
      rlim_cur: bytes,
      rlim_max: bytes,
    };
    let result = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
    if result != 0 {
      eprintln!("magpie-parser: failed to apply memory limit of {} MB", limit_mb);
    }
  }
  #[cfg(not(unix))]
  {
    let _ = limit_mb;
  }
}

fn parse_mem_limit() -> Option<u64> {
  let mut args = std::env::args().skip(1);
  while let Some(arg) = args.next() {
    if arg == "--mem-limit-mb" {
      return args.next().and_then(|value| value.parse().ok());
    }
  }
  None
}

fn fail(error: String) -> ! {
  let output = ParserFailureOutput { error, stack: None };
  let _ = serde_json::to_writer(std::io::stdout().lock(), &output);
  let _ = std::io::stdout().flush();
  std::process::exit(1);
}

fn main() {
  if let Some(limit_mb) = parse_mem_limit() {
    apply_memory_limit(limit_mb);
  }

  let mut input = String::new();
  if let Err(e) = std::io::stdin().lock().read_to_string(&mut input) {
    fail(format!("failed to read stdin: {}", e));
  }
  let request: ParserRequest = match serde_json::from_str(&input) {
    Ok(request) => request,
    Err(e) => fail(format!("invalid request: {}", e)),
  };
  drop(input);

  eprintln!(
    "magpie-parser: job {} parsing {} ({} bytes)",
    request.job_id,
    request.url,
    request.html_content.len()
  );

  match extract(&request.html_content, &request.url) {
    Ok(page) => {
      if let Err(e) = serde_json::to_writer(std::io::stdout().lock(), &page) {
        fail(format!("failed to write output: {}", e));
      }
      let _ = std::io::stdout().flush();
    }
    Err(e) => fail(e.to_string()),
  }
}
