// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Logging-verbosity and color flags, shared by this crate's one binary.
//! Plain `env_logger::init()` only reads `RUST_LOG`; this lets the CLI
//! itself raise or lower the default filter and force color on or off,
//! the way most `clap`-based daemons in this codebase's ecosystem do.

use clap::{Parser, ValueEnum};
use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

impl From<ColorMode> for env_logger::WriteStyle {
    fn from(mode: ColorMode) -> Self {
        match mode {
            ColorMode::Auto => env_logger::WriteStyle::Auto,
            ColorMode::Always => env_logger::WriteStyle::Always,
            ColorMode::Never => env_logger::WriteStyle::Never,
        }
    }
}

/// `-v`/`-q` are repeatable and offset from a `Info` default: each `-v`
/// raises the filter one level, each `-q` lowers it one level. `RUST_LOG`
/// still takes precedence if set, matching `env_logger`'s own convention.
#[derive(Debug, Parser)]
pub struct LogArgs {
    /// Increase log verbosity. May be repeated (-vv for Debug, -vvv for Trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease log verbosity. May be repeated.
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count, global = true)]
    quiet: u8,

    /// Whether to colorize log output.
    #[arg(long, value_enum, default_value_t = ColorMode::Auto, global = true)]
    color: ColorMode,
}

impl LogArgs {
    fn level_filter(&self) -> LevelFilter {
        const LEVELS: [LevelFilter; 5] = [
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ];
        let base = 2i32; // Info
        let offset = self.verbose as i32 - self.quiet as i32;
        let index = (base + offset).clamp(0, LEVELS.len() as i32 - 1) as usize;
        LEVELS[index]
    }

    /// Installs an `env_logger` built from these flags as the global logger.
    pub fn init_logger(&self) {
        env_logger::Builder::new()
            .filter_level(self.level_filter())
            .parse_default_env()
            .write_style(self.color.into())
            .init();
    }
}
