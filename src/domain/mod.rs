//! Core domain types and logic.

pub mod account;
pub mod alert;
pub mod confirmation;
pub mod cycle;
pub mod cycle_tracker;
pub mod engine;
pub mod error;
pub mod indicator;
pub mod indicator_helpers;
pub mod instrument;
pub mod ohlcv;
pub mod rule;
pub mod rule_eval;
pub mod rule_parser;
pub mod settings;
pub mod signal;
pub mod state_store;
