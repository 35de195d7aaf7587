//! Library for Trellis CLI utilities and shared functionality.

pub mod commands;
pub mod output;

pub use output::OutputFormat;
