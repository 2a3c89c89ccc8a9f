// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Runtime configuration, read from the environment with fixed defaults --
//! no config file format, matching the rest of this codebase's
//! env-var-or-flag approach to configuration.

use std::path::PathBuf;

pub const DEFAULT_RUNTIME_DIR: &str = "/run/vmmd";
pub const DEFAULT_SOCKET_NAME: &str = "vmmd.sock";
pub const DEFAULT_CONSOLE_SOCKET_NAME: &str = "cons.sock";
pub const DEFAULT_STAT_SOCKET_NAME: &str = "stat.sock";
pub const DEFAULT_LOG_SOCKET_NAME: &str = "log.sock";
pub const DEFAULT_HYPERVISOR_BIN: &str = "/usr/local/bin/vmm-launch";
pub const DEFAULT_TAP_COUNT: usize = 64;
pub const DEFAULT_TOTAL_MEM_MB: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory console FIFOs and the helper sockets live under.
    pub runtime_dir: PathBuf,

    /// The control socket clients (the CLI, tests) send commands to.
    pub socket_path: PathBuf,

    /// The console multiplexer's socket, for `AddConsole` requests.
    pub console_socket_path: PathBuf,

    /// The stats helper's socket. Optional: if nothing is listening here,
    /// vmmd starts anyway and stat effects are silently dropped.
    pub stat_socket_path: PathBuf,

    /// The log helper's socket. Required: vmmd refuses to start if it
    /// cannot connect here.
    pub log_socket_path: PathBuf,

    /// The hypervisor binary spawned for each successfully created VM.
    pub hypervisor_bin: PathBuf,

    /// Number of tap devices available for allocation.
    pub tap_count: usize,

    /// Total memory budget, in MiB, available for allocation.
    pub total_mem_mb: u64,
}

impl Config {
    /// Builds a `Config` from environment variables, falling back to
    /// fixed defaults rooted at [`DEFAULT_RUNTIME_DIR`] (overridable with
    /// `VMMD_RUNTIME_DIR`).
    pub fn from_env() -> Self {
        let runtime_dir = env_path("VMMD_RUNTIME_DIR", DEFAULT_RUNTIME_DIR);

        let socket_path = env_path_or("VMMD_SOCKET", || runtime_dir.join(DEFAULT_SOCKET_NAME));
        let console_socket_path = env_path_or("VMM_CONSOLE_SOCKET", || {
            runtime_dir.join(DEFAULT_CONSOLE_SOCKET_NAME)
        });
        let stat_socket_path =
            env_path_or("VMMD_STAT_SOCKET", || runtime_dir.join(DEFAULT_STAT_SOCKET_NAME));
        let log_socket_path =
            env_path_or("VMMD_LOG_SOCKET", || runtime_dir.join(DEFAULT_LOG_SOCKET_NAME));
        let hypervisor_bin = env_path("VMMD_HYPERVISOR_BIN", DEFAULT_HYPERVISOR_BIN);

        let tap_count = std::env::var("VMMD_TAP_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TAP_COUNT);
        let total_mem_mb = std::env::var("VMMD_TOTAL_MEM_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TOTAL_MEM_MB);

        Self {
            runtime_dir,
            socket_path,
            console_socket_path,
            stat_socket_path,
            log_socket_path,
            hypervisor_bin,
            tap_count,
            total_mem_mb,
        }
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_path_or(var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| default())
}
