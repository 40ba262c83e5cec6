pub mod backtester;
pub mod bar_utils;
pub mod cache;
pub mod config;
pub mod data_context;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod portfolio;
pub mod report;
pub mod result;
pub mod strategy;
pub mod strategy_utils;
pub mod trade;
pub mod trend;
