pub mod analysis;
pub mod classify;
pub mod execution_log;
pub mod manifest;
pub mod redis;
pub mod types;
