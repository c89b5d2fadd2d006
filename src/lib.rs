pub mod cli;
pub mod config;
pub mod event;
pub mod gateway;
pub mod log;
pub mod writer;
