//! CLI command handlers

pub mod inspect;
pub mod simulate;
