//! Command handlers invoked by the CLI

pub mod initialize;
