//! TUN device: open `/dev/net/tun`, configure it as a point-to-point IPv4
//! interface via ioctls, and expose raw frame read/write. No TUN-handling
//! crate appears anywhere in the example pack (only a dependency *shape* —
//! `libc` + `tokio` — survives in `firezone`'s `rust/tun` crate), so this is
//! hand-rolled against the kernel interface directly, the way the rest of
//! this server already talks to raw sockets.

use crate::error::TundError;
use std::fs::{File, OpenOptions};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;

const IFNAMSIZ: usize = 16;
const TUN_DEV_PATH: &str = "/dev/net/tun";

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 64],
}

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

ioctl_write_helpers::ioctl_write_int_bad!(tunsetiff, 0x400454ca);

mod ioctl_write_helpers {
    // A small local stand-in for the handful of `nix`-style ioctl macros
    // this module needs, so the crate doesn't pull in `nix` for one call.
    macro_rules! ioctl_write_int_bad {
        ($name:ident, $nr:expr) => {
            pub unsafe fn $name(fd: std::os::unix::io::RawFd, data: *mut super::IfReq) -> std::io::Result<()> {
                let ret = libc::ioctl(fd, $nr as libc::c_ulong, data);
                if ret < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }
        };
    }
    pub(crate) use ioctl_write_int_bad;
}

/// An open, configured TUN device.
pub struct Tun {
    file: File,
    name: String,
}

impl Tun {
    /// Open `/dev/net/tun`, request interface `name` (or let the kernel pick
    /// one if empty) in IFF_TUN|IFF_NO_PI mode, then bring it up with the
    /// given local address and MTU via `ip`/`ifconfig`-level ioctls and a
    /// small `ip` invocation for routing — unless `skip_ip_config` is set,
    /// in which case the interface is assumed already configured.
    pub fn open(
        requested_name: &str,
        local: Ipv4Addr,
        mtu: u16,
        skip_ip_config: bool,
    ) -> Result<Self, TundError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEV_PATH)
            .map_err(|e| TundError::TunOpen(e.to_string()))?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 64],
        };
        let name_bytes = requested_name.as_bytes();
        if name_bytes.len() >= IFNAMSIZ {
            return Err(TundError::TunConfig(format!(
                "interface name {requested_name:?} too long"
            )));
        }
        for (slot, byte) in ifr.ifr_name.iter_mut().zip(name_bytes) {
            *slot = *byte as libc::c_char;
        }

        unsafe {
            ioctl_write_helpers::tunsetiff(file.as_raw_fd(), &mut ifr)
                .map_err(|e| TundError::TunConfig(e.to_string()))?;
        }

        crate::netio::set_nonblocking(file.as_raw_fd())
            .map_err(|e| TundError::TunConfig(e.to_string()))?;

        let name = std::str::from_utf8(unsafe {
            std::slice::from_raw_parts(ifr.ifr_name.as_ptr() as *const u8, IFNAMSIZ)
        })
        .unwrap_or("")
        .trim_end_matches('\0')
        .to_string();

        let tun = Tun { file, name };
        if !skip_ip_config {
            tun.configure_address(local, mtu)?;
        }
        Ok(tun)
    }

    fn configure_address(&self, local: Ipv4Addr, mtu: u16) -> Result<(), TundError> {
        run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()])?;
        run_ip(&[
            "addr", "add", &format!("{local}/32"), "dev", &self.name,
        ])?;
        run_ip(&["link", "set", "dev", &self.name, "up"])?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one frame. With `IFF_NO_PI` set at open time the kernel omits
    /// its usual 4-byte link header, so `buf` starts directly with the IPv4
    /// packet.
    ///
    /// Takes `&self`, not `&mut self`: the character device has no Rust-side
    /// buffering to protect, and `AsyncFd`'s readiness guard only hands back
    /// a shared reference to the wrapped value.
    pub fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.file.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(
                self.file.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl AsRawFd for Tun {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn run_ip(args: &[&str]) -> Result<(), TundError> {
    let status = Command::new("ip")
        .args(args)
        .status()
        .map_err(|e| TundError::TunConfig(format!("failed to run ip {args:?}: {e}")))?;
    if !status.success() {
        return Err(TundError::TunConfig(format!(
            "ip {args:?} exited with {status}"
        )));
    }
    Ok(())
}

/// Whether the current process believes it can open `/dev/net/tun` at all —
/// used by bootstrap to fail fast with a clear message.
pub fn device_node_exists() -> bool {
    std::path::Path::new(TUN_DEV_PATH).exists()
}
