//! The event loop: one `tokio::select!` per iteration over the DNS socket,
//! the forwarder socket, and the TUN device, on a `current_thread` runtime
//! with no spawned tasks — the whole server is one cooperative loop, so no
//! locking is needed anywhere in `dispatch.rs` or `session.rs`.

use crate::dispatch::{self, TunnelContext};
use crate::dns::{self, QTYPE_NULL};
use crate::forwarder::{ForwardRecord, ForwardTable};
use crate::netio::DnsSocket;
use crate::tun::Tun;
use crate::tun_ingress::{self, IngressOutcome};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration};

const MAX_DNS_PACKET: usize = 4096;
const MAX_TUN_FRAME: usize = 65536;
const FORWARD_TABLE_CAPACITY: usize = 64;

pub struct Server {
    dns: AsyncFd<DnsSocket>,
    forward: UdpSocket,
    /// `None` unless the stub forwarder was enabled (`-b`); out-of-zone
    /// queries are dropped rather than relayed when absent.
    forward_addr: Option<SocketAddr>,
    tun: AsyncFd<Tun>,
    ctx: TunnelContext,
    forward_table: ForwardTable,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(
        dns: DnsSocket,
        forward: UdpSocket,
        forward_addr: Option<SocketAddr>,
        tun: Tun,
        ctx: TunnelContext,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        Ok(Server {
            dns: AsyncFd::new(dns)?,
            forward,
            forward_addr,
            tun: AsyncFd::new(tun)?,
            ctx,
            forward_table: ForwardTable::new(FORWARD_TABLE_CAPACITY),
            shutdown,
        })
    }

    pub async fn run(&mut self) -> io::Result<()> {
        let mut tick = interval(Duration::from_secs(1));
        let mut dns_buf = vec![0u8; MAX_DNS_PACKET];
        let mut tun_buf = vec![0u8; MAX_TUN_FRAME];
        let mut fwd_buf = vec![0u8; MAX_DNS_PACKET];

        while !self.shutdown.load(Ordering::Relaxed) {
            let tun_blocked = self.ctx.sessions.all_waiting_to_send();

            tokio::select! {
                biased;

                guard = self.tun.readable(), if !tun_blocked => {
                    // `AsyncFdReadyGuard` borrows `self.tun` for as long as
                    // it's alive (it has a `Drop` impl), so the result must
                    // be pulled out and the guard dropped before any method
                    // needing `&mut self` runs below.
                    let outcome = match guard {
                        Ok(mut guard) => {
                            let r = guard.try_io(|inner| inner.get_ref().read_frame(&mut tun_buf));
                            drop(guard);
                            Some(r)
                        }
                        Err(e) => {
                            warn!("tun readiness error: {e}");
                            None
                        }
                    };
                    match outcome {
                        Some(Ok(Ok(n))) => self.on_tun_frame(&tun_buf[..n]),
                        Some(Ok(Err(e))) => warn!("tun read error: {e}"),
                        Some(Err(_)) | None => {}
                    }
                }

                guard = self.dns.readable() => {
                    let outcome = match guard {
                        Ok(mut guard) => {
                            let r = guard.try_io(|inner| inner.get_ref().recv_query(&mut dns_buf));
                            drop(guard);
                            Some(r)
                        }
                        Err(e) => {
                            warn!("dns readiness error: {e}");
                            None
                        }
                    };
                    match outcome {
                        Some(Ok(Ok(Some((query, n))))) => {
                            let raw = dns_buf[..n].to_vec();
                            self.on_dns_query(query, raw).await
                        }
                        Some(Ok(Ok(None))) => debug!("dropped malformed dns packet"),
                        Some(Ok(Err(e))) => warn!("dns recv error: {e}"),
                        Some(Err(_)) | None => {}
                    }
                }

                result = self.forward.recv_from(&mut fwd_buf) => {
                    match result {
                        Ok((n, _from)) => self.on_forward_reply(&fwd_buf[..n]).await,
                        Err(e) => warn!("forward recv error: {e}"),
                    }
                }

                _ = tick.tick() => {
                    // Periodic wakeup only; no per-tick bookkeeping today,
                    // but this is where session expiry would be driven.
                }

                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("received shutdown signal");
                        self.shutdown.store(true, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_tun_frame(&mut self, frame: &[u8]) {
        match tun_ingress::handle_frame(&mut self.ctx.sessions, frame) {
            IngressOutcome::Queued { userid } => {
                debug!("queued downstream frame for user {userid}");
            }
            IngressOutcome::NoSuchUser => debug!("tun frame for unknown destination dropped"),
            IngressOutcome::Busy => debug!("tun frame dropped, user already has payload queued"),
            IngressOutcome::Malformed => debug!("malformed tun frame dropped"),
        }
    }

    async fn on_dns_query(&mut self, query: crate::dns::Query, raw: Vec<u8>) {
        match dispatch::handle_query(&mut self.ctx, query.clone()) {
            Some(result) => {
                for outgoing in result.answers {
                    let packet = dns::encode_answer(&outgoing.query, QTYPE_NULL, &outgoing.payload);
                    if let Err(e) = self.send_dns(outgoing.query.src_addr, &packet) {
                        warn!("failed to send dns answer: {e}");
                    }
                }
                if let Some(frame) = result.to_tun {
                    if let Err(e) = self.write_tun(&frame) {
                        warn!("failed to write tun frame: {e}");
                    }
                }
            }
            None => {
                // Out-of-zone query: relay the original bytes to the stub
                // resolver, unmodified, and remember who to answer. Dropped
                // outright if forwarding isn't enabled.
                match self.forward_addr {
                    Some(addr) => {
                        self.forward_table.put(ForwardRecord {
                            original_src: query.src_addr,
                            id: query.id,
                        });
                        if let Err(e) = self.forward.send_to(&raw, addr).await {
                            warn!("failed to relay query upstream: {e}");
                        }
                    }
                    None => debug!("out-of-zone query dropped, forwarding disabled"),
                }
            }
        }
    }

    async fn on_forward_reply(&mut self, packet: &[u8]) {
        let Some(reply) = dns::decode_query(packet) else {
            return;
        };
        let Some(original_src) = self.forward_table.take(reply.id) else {
            debug!("forward reply for unknown id {}", reply.id);
            return;
        };
        // Relayed to the client via the DNS socket, not the forwarder's own
        // ephemeral socket — the client is expecting a reply from the
        // server it queried, not from whatever port the forwarder bound.
        if let Err(e) = self.send_dns(original_src, packet) {
            warn!("failed to relay reply downstream: {e}");
        }
    }

    fn send_dns(&self, dst: SocketAddr, packet: &[u8]) -> io::Result<()> {
        self.dns.get_ref().send_answer(dst, packet)
    }

    fn write_tun(&self, frame: &[u8]) -> io::Result<()> {
        self.tun.get_ref().write_frame(frame).map(|_| ())
    }
}

pub fn shutdown_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}
