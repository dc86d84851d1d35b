//! DNS socket I/O: receive queries and send answers over a raw UDP socket,
//! capturing the original destination address via ancillary control data
//! where the OS provides it (`IP_PKTINFO` on Linux), following the same
//! raw-`libc` pattern the original server used for `SO_ORIGINAL_DST`.

use crate::dns::{self, Query};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

/// A UDP socket bound for DNS traffic, with `IP_PKTINFO` enabled so
/// `recv_query` can recover the packet's original destination address —
/// needed when the server listens on multiple local addresses.
pub struct DnsSocket {
    fd: RawFd,
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// `AsyncFd` requires a non-blocking descriptor; it only uses epoll
/// readiness to decide when to retry, never blocks in the syscall itself.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = check(libc::fcntl(fd, libc::F_GETFL))?;
        check(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

impl DnsSocket {
    pub fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        unsafe {
            let fd = check(libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0))?;
            let enable: libc::c_int = 1;
            let rc = libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_PKTINFO,
                &enable as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            if rc < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let sockaddr = to_sockaddr_in(addr);
            let rc = libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            if rc < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            set_nonblocking(fd).map_err(|e| {
                libc::close(fd);
                e
            })?;

            Ok(DnsSocket { fd })
        }
    }

    /// Receive one datagram, decode its DNS question, and fill in both the
    /// source and (when available) destination address. Returns the decoded
    /// query along with the number of raw bytes read, so a caller that needs
    /// to relay the packet byte-exact (the stub-resolver forwarder) doesn't
    /// have to re-encode it.
    pub fn recv_query(&self, buf: &mut [u8]) -> io::Result<Option<(Query, usize)>> {
        let mut src_storage = MaybeUninit::<libc::sockaddr_in>::zeroed();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 128];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = src_storage.as_mut_ptr() as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        let n = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let src_in = unsafe { src_storage.assume_init() };
        let src_addr = sockaddr_in_to_socketaddr(&src_in);
        let dst_addr = unsafe { extract_pktinfo(&msg) };

        let Some(mut query) = dns::decode_query(&buf[..n as usize]) else {
            return Ok(None);
        };
        query.src_addr = src_addr;
        query.dst_addr = dst_addr;
        Ok(Some((query, n as usize)))
    }

    pub fn send_answer(&self, dst: SocketAddr, packet: &[u8]) -> io::Result<()> {
        let SocketAddr::V4(dst) = dst else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPv6 destinations are not supported",
            ));
        };
        let sockaddr = to_sockaddr_in(dst);
        let rc = unsafe {
            libc::sendto(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        check(rc as libc::c_int).map(|_| ())
    }
}

impl Drop for DnsSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for DnsSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

fn sockaddr_in_to_socketaddr(sa: &libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
    let port = u16::from_be(sa.sin_port);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

/// Walk the control message chain looking for `IP_PKTINFO`, which on Linux
/// carries the packet's original local (destination) address.
unsafe fn extract_pktinfo(msg: &libc::msghdr) -> Option<SocketAddr> {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let hdr = &*cmsg;
        if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
            let data = libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo;
            let pktinfo = &*data;
            let ip = Ipv4Addr::from(pktinfo.ipi_addr.s_addr.to_ne_bytes());
            return Some(SocketAddr::V4(SocketAddrV4::new(ip, 0)));
        }
        cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 5353);
        let raw = to_sockaddr_in(addr);
        let back = sockaddr_in_to_socketaddr(&raw);
        assert_eq!(back, SocketAddr::V4(addr));
    }
}
