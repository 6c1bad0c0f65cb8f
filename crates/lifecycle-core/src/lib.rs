pub mod calculations;
pub mod calendar;
pub mod config;
pub mod counters;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod settings;
pub mod thresholds;
pub mod time_utils;
