pub mod backend;
pub mod cancellation;
pub mod cli;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
