//! iodns-tund: authoritative NULL-record DNS tunnel endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use iodns_tund::bootstrap;
use iodns_tund::config::{Cli, Config};
use iodns_tund::server::{shutdown_flag, Server};
use log::info;
use tokio::net::UdpSocket;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("iodns-tund {VERSION} ({GIT_HASH}, built {BUILD_DATE})");
        return Ok(());
    }

    let log_level = match cli.debug {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    info!("iodns-tund {VERSION} ({GIT_HASH}, built {BUILD_DATE})");

    bootstrap::require_root().context("refusing to start")?;

    let cfg = Config::from_cli(cli).context("invalid configuration")?;

    let bringup = bootstrap::bring_up(&cfg).context("failed to bring up tunnel")?;
    let forward_socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind forwarder socket")?;

    bootstrap::daemonize(cfg.foreground).context("failed to daemonize")?;

    if let Some(dir) = &cfg.chroot_dir {
        bootstrap::chroot(dir).context("failed to chroot")?;
    }
    if let Some(user) = &cfg.user {
        bootstrap::drop_privileges(user).context("failed to drop privileges")?;
    }

    let shutdown = shutdown_flag();
    let mut server = Server::new(
        bringup.dns,
        forward_socket,
        cfg.forward_addr,
        bringup.tun,
        bringup.ctx,
        shutdown,
    )
    .context("failed to initialize event loop")?;

    info!(
        "listening on port {} for topdomain {}",
        cfg.port, cfg.topdomain
    );
    server.run().await.context("event loop exited with an error")?;

    Ok(())
}
