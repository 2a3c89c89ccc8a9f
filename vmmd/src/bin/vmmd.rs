// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use vmmd::config::Config;
use vmmd::logging::LogArgs;

#[derive(Parser)]
struct Cli {
    /// Runtime directory for console FIFOs, sockets, and the stats sink.
    /// Overridable with `VMMD_RUNTIME_DIR`.
    #[arg(long, env = "VMMD_RUNTIME_DIR")]
    runtime_dir: Option<String>,

    #[command(flatten)]
    log: LogArgs,
}

fn main() {
    let args = Cli::parse();
    args.log.init_logger();

    if let Some(dir) = args.runtime_dir {
        std::env::set_var("VMMD_RUNTIME_DIR", dir);
    }

    let config = Config::from_env();
    if let Err(e) = vmmd::run(config) {
        log::error!("vmmd exiting: {e}");
        std::process::exit(1);
    }
}
