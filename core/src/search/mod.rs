pub mod batch_writer;
pub mod search_index;
pub mod search_jobs;
