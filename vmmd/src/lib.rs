// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! `vmmd`: the supervisor daemon. Wires the pure engine in [`vmm_engine`]
//! up to the outside world -- client connections, the console helper, the
//! hypervisor processes it spawns and reaps, and graceful shutdown.

pub mod config;
pub mod console_link;
pub mod error;
pub mod log_link;
pub mod logging;
pub mod signals;
pub mod stat_link;
pub mod stats_reporter;
pub mod supervisor;

pub use config::Config;
pub use error::Error;
pub use supervisor::{run, SupervisorEvent};
