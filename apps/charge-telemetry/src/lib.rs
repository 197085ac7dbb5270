pub mod buffer;
pub mod charge_time;
pub mod config;
pub mod error;
pub mod estimator;
pub mod flush;
pub mod sample;
pub mod store;

#[cfg(test)]
pub mod test_support;
