//! iodns-tund: an authoritative DNS tunnel endpoint.
//!
//! This server answers NULL-type queries for a delegated topdomain by
//! decoding an encapsulated IP payload out of the query name, forwarding it
//! to a local TUN device, and returning queued downstream traffic encoded
//! into the matching answer. Everything outside the delegated zone is
//! relayed to a stub resolver and replied to verbatim.
//!
//! ## Quick Start
//!
//! ```bash
//! sudo iodns-tund -f 10.0.0.1 tunnel.example.com
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  NULL query   ┌──────────────┐   frame    ┌─────────┐
//! │ DNS client │ ─────────────▶│  dispatch.rs │ ──────────▶│   TUN   │
//! └────────────┘◀───────────── │ session.rs   │◀────────── └─────────┘
//!                 NULL answer  └──────────────┘
//!                                     │
//!                                     │ out-of-zone
//!                                     ▼
//!                              ┌──────────────┐
//!                              │  forwarder   │── stub resolver
//!                              └──────────────┘
//! ```
//!
//! The whole server runs as a single cooperative event loop (`server.rs`)
//! on a `current_thread` Tokio runtime: no locks anywhere in this crate,
//! because nothing runs concurrently with it.

pub mod auth;
pub mod bootstrap;
pub mod classifier;
pub mod compress;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod encoding;
pub mod error;
pub mod forwarder;
pub mod netio;
pub mod server;
pub mod session;
pub mod tun;
pub mod tun_ingress;

pub use config::{Cli, Config};
pub use dispatch::{dispatch, handle_query, DispatchResult, Outgoing, TunnelContext};
pub use error::TundError;
pub use server::Server;
pub use session::{Session, SessionTable, USERS};
