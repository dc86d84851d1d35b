//! Error types for configuration, bring-up and I/O.

use thiserror::Error;

/// Errors surfaced by configuration validation and bring-up. Protocol-level
/// rejections (`BADIP`, `LNAK`, `VNAK`, `VFUL`) are not represented here —
/// they are valid wire responses, not failures, and are encoded directly by
/// the dispatcher.
#[derive(Debug, Error)]
pub enum TundError {
    #[error("bad MTU: must be a positive integer")]
    BadMtu,

    #[error("bad port number: {0}")]
    BadPort(u32),

    #[error("missing required argument: {0}")]
    MissingArgument(String),

    #[error("forward port {0} must differ from listen port")]
    PortCollision(u16),

    #[error("topdomain too long: max 128 octets")]
    TopdomainTooLong,

    #[error("topdomain contains invalid characters: {0}")]
    BadTopdomain(String),

    #[error("must run as root")]
    NotRoot,

    #[error("user '{0}' does not exist")]
    NoSuchUser(String),

    #[error("failed to open tun device: {0}")]
    TunOpen(String),

    #[error("failed to configure tun device: {0}")]
    TunConfig(String),

    #[error("failed to bind dns socket on {0}: {1}")]
    SocketBind(std::net::SocketAddr, std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
