// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use vmm_console::logging::LogArgs;

/// Default console socket path, overridable with `--socket` or
/// `VMM_CONSOLE_SOCKET`.
const DEFAULT_SOCKET: &str = "/run/vmmd/cons.sock";

#[derive(Parser)]
struct Cli {
    /// Unix socket to listen on for AddConsole/AttachConsole/DetachConsole/
    /// History requests.
    #[arg(short = 's', long, env = "VMM_CONSOLE_SOCKET", default_value = DEFAULT_SOCKET)]
    socket: String,

    #[command(flatten)]
    log: LogArgs,
}

fn main() {
    let args = Cli::parse();
    args.log.init_logger();

    if let Err(e) = vmm_console::run_server(&args.socket) {
        log::error!("console multiplexer exiting: {e}");
        std::process::exit(1);
    }
}
