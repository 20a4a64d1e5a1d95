//! A minimal container runtime
//!
//! Containers get their own UTS, PID, mount, network, and IPC namespaces, a
//! root filesystem unpacked from an image and entered with `pivot_root`, and
//! a cgroup bounding memory and CPU. Container state lives in JSON records
//! under a state root, and liveness is always re-checked against the host's
//! process table.

#[cfg(not(unix))]
compile_error!("minibox only works on unix hosts");

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate serde;

pub mod cgroup;
pub mod config;
pub mod container;
pub mod errors;
pub mod image;
pub mod isolation;
pub mod limits;
pub mod ports;
pub mod process;
pub mod registry;
pub mod security;
pub mod storage;
pub mod volume;

pub use crate::{
    config::RuntimeConfig,
    container::{ContainerId, ContainerRecord, ContainerStatus, RunOptions, Runtime},
    security::SecurityProfile,
};
