//! Core types and functionality for dailyrun.
//!
//! This module contains the building blocks shared by every run: process
//! commands and their executor, configuration, and the run history.

mod command;
mod config;
mod executor;
mod history;

pub use command::{find_in_path, Command, Shell};
pub use config::{expand_path, Config, GeneralConfig, HistoryConfig, RuntimeConfig, SchedulerConfig};
pub use executor::{ExecutionResult, Executor, Stream};
pub use history::{RunHistory, DEFAULT_MAX_RUNS};
