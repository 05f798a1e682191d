pub mod assets;
pub mod bookmarks;
pub mod context;
pub mod crawler;
pub mod enrichment;
pub mod helpers;
pub mod hooks;
pub mod import;
pub mod metrics;
pub mod parser;
pub mod queue;
pub mod search;
pub mod settings;
pub mod sqlite;
pub mod telemetry;
