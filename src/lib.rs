//! GHOSTS endpoint agent: timeline orchestration core.

pub mod agent;
pub mod comms;
pub mod config;
pub mod error;
pub mod handlers;
pub mod listeners;
pub mod logging;
pub mod safety_net;
pub mod scheduler;
pub mod timeline;
pub mod watch;
