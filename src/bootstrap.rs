//! Process bring-up: TUN and socket creation (with stepwise cleanup on
//! failure), then daemonization, chroot, and privilege drop in that order,
//! mirroring the original server's startup sequence.

use crate::config::Config;
use crate::dispatch::TunnelContext;
use crate::error::TundError;
use crate::netio::DnsSocket;
use crate::session::SessionTable;
use crate::tun::Tun;
use log::info;
use std::ffi::CString;
use std::net::SocketAddrV4;

/// Everything needed to start the event loop, already bound/opened.
pub struct Bringup {
    pub dns: DnsSocket,
    pub tun: Tun,
    pub ctx: TunnelContext,
}

/// Open the TUN device and DNS socket. On any failure after the TUN device
/// is open, it is dropped (and thus closed) before returning the error, so
/// a caller never leaks a half-configured interface.
pub fn bring_up(cfg: &Config) -> Result<Bringup, TundError> {
    if !crate::tun::device_node_exists() {
        return Err(TundError::TunOpen("/dev/net/tun not present".to_string()));
    }

    let tun = Tun::open(&cfg.device, cfg.tunnel_ip, cfg.mtu, cfg.skip_ip_config)?;
    info!("opened tun device {}", tun.name());

    let listen = SocketAddrV4::new(cfg.listen, cfg.port);
    let dns = match DnsSocket::bind(listen) {
        Ok(s) => s,
        Err(e) => {
            drop(tun);
            return Err(TundError::SocketBind(listen.into(), e));
        }
    };

    let sessions = SessionTable::new(cfg.tunnel_ip);
    let ctx = TunnelContext {
        sessions,
        topdomain: crate::classifier::topdomain_labels(&cfg.topdomain),
        password: cfg.password.clone(),
        check_ip: cfg.check_ip,
        mtu: cfg.mtu,
    };

    Ok(Bringup { dns, tun, ctx })
}

/// Refuse to continue unless running as root — dropping privileges or
/// chrooting later requires it.
pub fn require_root() -> Result<(), TundError> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(TundError::NotRoot);
    }
    Ok(())
}

/// Double-fork and detach from the controlling terminal, unless running in
/// the foreground.
pub fn daemonize(foreground: bool) -> std::io::Result<()> {
    if foreground {
        return Ok(());
    }
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() < 0 {
            return Err(std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
    }
    Ok(())
}

/// `chroot` into `dir` and change the working directory to `/` within it.
pub fn chroot(dir: &str) -> Result<(), TundError> {
    let c_dir = CString::new(dir).map_err(|_| TundError::TunConfig("chroot path has a NUL byte".to_string()))?;
    unsafe {
        if libc::chroot(c_dir.as_ptr()) != 0 {
            return Err(TundError::Io(std::io::Error::last_os_error()));
        }
        if libc::chdir(b"/\0".as_ptr() as *const libc::c_char) != 0 {
            return Err(TundError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Drop from root to `username`, clearing supplementary groups first.
pub fn drop_privileges(username: &str) -> Result<(), TundError> {
    let c_user =
        CString::new(username).map_err(|_| TundError::NoSuchUser(username.to_string()))?;
    let mut pwd_storage = std::mem::MaybeUninit::<libc::passwd>::uninit();
    let mut buf = vec![0i8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            c_user.as_ptr(),
            pwd_storage.as_mut_ptr(),
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Err(TundError::NoSuchUser(username.to_string()));
    }
    let pwd = unsafe { pwd_storage.assume_init() };

    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(TundError::Io(std::io::Error::last_os_error()));
        }
        if libc::setgid(pwd.pw_gid) != 0 {
            return Err(TundError::Io(std::io::Error::last_os_error()));
        }
        if libc::setuid(pwd.pw_uid) != 0 {
            return Err(TundError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
