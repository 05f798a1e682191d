pub mod enrichment_jobs;
pub mod llm;
pub mod video_jobs;
