pub mod batches;
pub mod config;
pub mod run;
