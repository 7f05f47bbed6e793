//! Tunable limits for servers and sessions.
//!
//! Every limit has a compiled-in default that can be overridden through an
//! environment variable, read when the config is constructed.

use std::time::Duration;

/// Default number of queued oneway transactions allowed per local object.
pub const DEFAULT_MAX_PENDING_ONEWAY: usize = 10_000;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default time a freshly accepted connection has to send its header.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5_000);

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
}

fn max_pending_oneway() -> usize {
    env_usize("SOCKBINDER_MAX_PENDING_ONEWAY").unwrap_or(DEFAULT_MAX_PENDING_ONEWAY)
}

fn max_frame_size() -> usize {
    env_usize("SOCKBINDER_MAX_FRAME_SIZE").unwrap_or(DEFAULT_MAX_FRAME_SIZE)
}

fn handshake_timeout() -> Duration {
    env_usize("SOCKBINDER_HANDSHAKE_TIMEOUT_MS")
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
}

/// Limits shared by both ends of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Queued out-of-order oneway transactions per object before the
    /// session is considered flooded and torn down.
    pub max_pending_oneway: usize,
    /// Largest frame body accepted from the peer.
    pub max_frame_size: usize,
}

impl Limits {
    pub fn from_env() -> Self {
        Self {
            max_pending_oneway: max_pending_oneway(),
            max_frame_size: max_frame_size(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Incoming connections a client opens per session, and therefore
    /// serving tasks per session on this server.
    pub max_threads: usize,
    pub limits: Limits,
    pub handshake_timeout: Duration,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            max_threads: 1,
            limits: Limits::from_env(),
            handshake_timeout: handshake_timeout(),
        }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct RpcSessionConfig {
    /// Reverse connections opened to the server, each served by one task.
    pub max_threads: usize,
    pub limits: Limits,
    /// Time the server has to acknowledge each new connection.
    pub handshake_timeout: Duration,
}

impl Default for RpcSessionConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            limits: Limits::from_env(),
            handshake_timeout: handshake_timeout(),
        }
    }
}
