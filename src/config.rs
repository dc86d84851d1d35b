//! Command-line parsing and the validated configuration derived from it.

use crate::error::TundError;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Authoritative NULL-record tunnel endpoint bridging a TUN device to DNS
/// clients.
///
/// `-v` is reserved for version info (not verbosity — that's `-D`), so
/// clap's own `-V/--version` is disabled and `-v` is checked by hand in
/// `main.rs` before argument validation, the way `-h/--help` stays clap's.
#[derive(Parser, Debug)]
#[command(name = "iodns-tund", about, disable_version_flag = true)]
pub struct Cli {
    /// Print version information and exit.
    #[arg(short = 'v')]
    pub version: bool,

    /// Disable per-request IP pinning.
    #[arg(short = 'c', long = "no-ip-pin")]
    pub no_ip_pin: bool,

    /// Skip TUN IP/MTU configuration; the interface is assumed already set up.
    #[arg(short = 's', long = "skip-ip-config")]
    pub skip_ip_config: bool,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Increase debug verbosity; repeatable. Any use implies --foreground.
    #[arg(short = 'D', long = "debug", action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Drop privileges to this user after bringing up the tunnel.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// chroot to this directory after bringing up the tunnel.
    #[arg(short = 't', long = "chroot")]
    pub chroot_dir: Option<String>,

    /// TUN interface name to request (empty lets the kernel choose).
    #[arg(short = 'd', long = "dev", default_value = "")]
    pub device: String,

    /// MTU of the tunnel interface.
    #[arg(short = 'm', long, default_value_t = 1130)]
    pub mtu: u16,

    /// Local address to listen for DNS queries on.
    #[arg(short = 'l', long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub listen: Ipv4Addr,

    /// Local port to listen for DNS queries on.
    #[arg(short = 'p', long, default_value_t = 53)]
    pub port: u16,

    /// Enable the stub forwarder, relaying out-of-zone queries to
    /// 127.0.0.1:PORT. Forwarding is disabled unless this is given.
    #[arg(short = 'b', long = "forward-port")]
    pub forward_port: Option<u16>,

    /// Tunnel password. If omitted, read from `IODNS_PASSWORD` or prompted
    /// interactively.
    #[arg(short = 'P', long, env = "IODNS_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Tunnel server's own address on the TUN interface, e.g. 10.0.0.1.
    pub tunnel_ip: Option<Ipv4Addr>,

    /// Topdomain delegated to this server, e.g. tunnel.example.com.
    pub topdomain: Option<String>,
}

/// Validated, immutable configuration derived from `Cli`.
pub struct Config {
    pub mtu: u16,
    pub device: String,
    pub chroot_dir: Option<String>,
    pub user: Option<String>,
    pub foreground: bool,
    pub debug: u8,
    pub listen: Ipv4Addr,
    pub port: u16,
    /// `Some` only when `-b` enabled the stub forwarder; the forwarded-to
    /// address is always loopback, per spec.
    pub forward_addr: Option<SocketAddr>,
    pub check_ip: bool,
    pub skip_ip_config: bool,
    pub password: String,
    pub tunnel_ip: Ipv4Addr,
    pub topdomain: String,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, TundError> {
        if cli.mtu == 0 {
            return Err(TundError::BadMtu);
        }
        let tunnel_ip = cli
            .tunnel_ip
            .ok_or_else(|| TundError::MissingArgument("TUNNEL_IP".to_string()))?;
        let topdomain = cli
            .topdomain
            .ok_or_else(|| TundError::MissingArgument("TOPDOMAIN".to_string()))?;
        check_topdomain(&topdomain)?;

        let forward_addr = match cli.forward_port {
            Some(port) => {
                if port == cli.port {
                    return Err(TundError::PortCollision(cli.port));
                }
                Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
            }
            None => None,
        };

        let password = cli.password.clone().unwrap_or_else(prompt_password);
        let password = truncate_password(&password);

        Ok(Config {
            mtu: cli.mtu,
            device: cli.device,
            chroot_dir: cli.chroot_dir,
            user: cli.user,
            foreground: cli.foreground || cli.debug > 0,
            debug: cli.debug,
            listen: cli.listen,
            port: cli.port,
            forward_addr,
            check_ip: !cli.no_ip_pin,
            skip_ip_config: cli.skip_ip_config,
            password,
            tunnel_ip,
            topdomain,
        })
    }
}

/// Password material is capped and the original is not retained once
/// truncated — mirrors the original server's fixed-size password buffer.
const MAX_PASSWORD_LEN: usize = 32;

fn truncate_password(raw: &str) -> String {
    raw.chars().take(MAX_PASSWORD_LEN).collect()
}

fn prompt_password() -> String {
    eprint!("Tunnel password: ");
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return String::new();
    }
    line.trim_end_matches(['\n', '\r']).to_string()
}

/// A topdomain label set must fit in the tunnel-encoded payload budget and
/// contain only characters valid in a DNS label.
pub fn check_topdomain(topdomain: &str) -> Result<(), TundError> {
    if topdomain.is_empty() || topdomain.len() > 128 {
        return Err(TundError::TopdomainTooLong);
    }
    for label in topdomain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(TundError::BadTopdomain(topdomain.to_string()));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(TundError::BadTopdomain(topdomain.to_string()));
        }
    }
    Ok(())
}
