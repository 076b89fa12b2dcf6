//! Core domain types and logic.

pub mod quarter;
pub mod reference;
pub mod observation;
pub mod history;
pub mod audit;
pub mod robust_stats;
pub mod normalization;
pub mod bands;
pub mod scoring_config;
pub mod scoring;
pub mod settings;
pub mod error;
