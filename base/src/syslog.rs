// Copyright 2022 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Logger setup for the decoder tools.
//!
//! Library code only uses the `log` macros re-exported from this crate. Binaries call
//! [`init_with`] once at startup to route those records through `env_logger`.
//!
//! # Examples
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! if let Err(e) = syslog::init() {
//!     println!("failed to initialize logging: {}", e);
//!     return;
//! }
//! warn!("this is your {} warning", "final");
//! ```

use std::env;
use std::io::Write;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

/// Environment variable whose filter directives are applied on top of [`LogConfig::filter`].
pub const LOG_FILTER_ENV: &str = "RUST_LOG";

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// A global logger was already installed.
    #[error("logger is already initialized: {0}")]
    AlreadyInitialized(log::SetLoggerError),
}

/// Where log records are written.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogTarget {
    #[default]
    Stderr,
    Stdout,
}

/// Logging options, usually taken from the command line or a JSON config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `env_logger` filter directives, e.g. `info` or `vdec::pipeline=debug`.
    pub filter: String,
    /// Name printed in front of every record.
    pub proc_name: String,
    pub target: LogTarget,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: String::from("info"),
            proc_name: String::from("vdec"),
            target: LogTarget::Stderr,
        }
    }
}

/// Installs the logger with the default configuration.
pub fn init() -> Result<(), Error> {
    init_with(LogConfig::default())
}

/// Installs the logger described by `cfg`.
///
/// Directives in the `RUST_LOG` environment variable are parsed after `cfg.filter` so they win.
/// Only the first successful call in a process has any effect.
pub fn init_with(cfg: LogConfig) -> Result<(), Error> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&cfg.filter);
    if let Ok(filters) = env::var(LOG_FILTER_ENV) {
        builder.parse_filters(&filters);
    }
    builder.target(match cfg.target {
        LogTarget::Stderr => env_logger::Target::Stderr,
        LogTarget::Stdout => env_logger::Target::Stdout,
    });

    let proc_name = cfg.proc_name;
    builder.format(move |buf, record| {
        write!(buf, "[{} {}", record.level(), proc_name)?;
        if let Some(path) = record.file() {
            write!(buf, " {}", path)?;
            if let Some(line) = record.line() {
                write!(buf, ":{}", line)?;
            }
        }
        writeln!(buf, "] {}", record.args())
    });
    builder.try_init().map_err(Error::AlreadyInitialized)
}
