//! The `canopy` command-line host.

#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod app;
pub mod commands;
#[cfg(unix)]
mod signal_handler;

pub use app::run;
