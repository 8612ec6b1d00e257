//! Core library of the kitten container runtime.
//!
//! The two halves that do the real work are the container lifecycle
//! engine ([`container::Kitten`] plus the [`child`] entry point it
//! re-executes inside the new namespaces) and the orchestration layer
//! ([`manager::Manager`]), sitting on top of the host network fabric in
//! [`network`].

pub mod child;
pub mod config;
pub mod container;
pub mod manager;
pub mod namespaces;
pub mod network;
pub mod process;
pub mod utils;

use std::path::PathBuf;

use thiserror::Error;

use crate::container::ContainerStatus;

pub type Result<T> = std::result::Result<T, KittenError>;

/// Sentinel first argument that routes an invocation of the runtime
/// binary into the child entry point instead of the CLI.
pub const CHILD_SENTINEL: &str = "__kitten_child__";

#[derive(Debug, Error)]
pub enum KittenError {
    #[error("must run as root (current euid: {0})")]
    NotPrivileged(u32),
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] config::ConfigError),
    #[error("rootfs does not exist: {0:?}")]
    RootfsMissing(PathBuf),
    #[error("failed to start child process")]
    SpawnFailed(#[source] nix::Error),
    #[error("network setup failed")]
    Network(#[from] network::NetError),
    #[error("container not running (state: {0})")]
    NotRunning(ContainerStatus),
    #[error("container already started (state: {0})")]
    AlreadyStarted(ContainerStatus),
    #[error("circular dependency detected or missing dependency")]
    DependencyCycle,
    #[error("invalid port mapping: {0}")]
    InvalidPortMapping(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("unix syscall failed")]
    Nix(#[from] nix::Error),
    #[error("serialization failed")]
    Json(#[from] serde_json::Error),
}
