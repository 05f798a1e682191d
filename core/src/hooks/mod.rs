pub mod rule_engine;
pub mod webhook_jobs;
