pub mod backoff;
pub mod key_value_store;

#[cfg(test)]
pub mod test;
