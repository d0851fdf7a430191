pub mod batch;
pub mod checkpoint;
pub mod emitter;
pub mod error;
pub mod event;
pub mod executor;
pub mod health;
pub mod keys;
pub mod metrics;
pub mod metrics_consts;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod strategy;
pub mod test_utils;
