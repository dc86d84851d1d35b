//! Per-client session state: the fixed-capacity user table.

use crate::dns::Query;
use crate::encoding::Encoder;
use std::net::Ipv4Addr;
use std::time::Instant;

/// Number of session slots. A small fixed constant, per `spec.md` §3.
pub const USERS: usize = 16;

/// Upstream reassembly buffer. `len == offset` is an invariant maintained
/// by every handler that touches it — see `dispatch.rs`.
#[derive(Debug, Default)]
pub struct InPacket {
    pub data: Vec<u8>,
    pub len: usize,
    pub offset: usize,
}

impl InPacket {
    fn reset(&mut self) {
        self.data.clear();
        self.len = 0;
        self.offset = 0;
    }

    fn append(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
        self.len += chunk.len();
        self.offset += chunk.len();
    }
}

/// At-most-one pending downstream payload.
#[derive(Debug, Default)]
pub struct OutPacket {
    pub data: Vec<u8>,
    pub len: usize,
}

impl OutPacket {
    fn set(&mut self, data: Vec<u8>) {
        self.len = data.len();
        self.data = data;
    }

    fn clear(&mut self) {
        self.len = 0;
        self.data.clear();
    }
}

/// A DNS query held open with no answer sent yet, awaiting a downstream
/// payload. `None` unless a `P` or fragment branch parked one.
pub type ParkedQuery = Option<Query>;

/// One user-table slot.
#[derive(Debug)]
pub struct Session {
    pub active: bool,
    pub seed: u32,
    pub host: Option<Ipv4Addr>,
    pub tun_ip: Ipv4Addr,
    pub encoder: Encoder,
    pub last_pkt: Option<Instant>,
    pub parked_query: ParkedQuery,
    pub inpacket: InPacket,
    pub outpacket: OutPacket,
}

impl Session {
    fn empty(tun_ip: Ipv4Addr) -> Self {
        Session {
            active: false,
            seed: 0,
            host: None,
            tun_ip,
            encoder: Encoder::default(),
            last_pkt: None,
            parked_query: None,
            inpacket: InPacket::default(),
            outpacket: OutPacket::default(),
        }
    }

    /// Reset reassembly state after a completed upstream datagram.
    pub fn finish_inpacket(&mut self) {
        self.inpacket.reset();
    }

    pub fn append_upstream(&mut self, chunk: &[u8]) {
        self.inpacket.append(chunk);
    }

    /// Queue a downstream payload, unless one is already pending.
    /// Returns `true` if it was queued.
    pub fn try_queue_outpacket(&mut self, data: Vec<u8>) -> bool {
        if self.outpacket.len > 0 {
            return false;
        }
        self.outpacket.set(data);
        true
    }

    pub fn clear_outpacket(&mut self) {
        self.outpacket.clear();
    }

    pub fn park(&mut self, query: Query) {
        self.parked_query = Some(query);
    }

    pub fn take_parked(&mut self) -> ParkedQuery {
        self.parked_query.take()
    }

    pub fn clear_parked(&mut self) {
        self.parked_query = None;
    }
}

/// The fixed-size user table and the server's own tunnel address.
pub struct SessionTable {
    pub slots: Vec<Session>,
    pub server_tun_ip: Ipv4Addr,
}

impl SessionTable {
    /// Assign each slot a sequential tunnel address within the server's
    /// /24, starting right after the server's own address. Mirrors
    /// `init_users()` in the original, invoked once the server's tunnel IP
    /// is known.
    pub fn new(server_tun_ip: Ipv4Addr) -> Self {
        let octets = server_tun_ip.octets();
        let base = u32::from_be_bytes(octets) & 0xffff_ff00;
        let slots = (0..USERS)
            .map(|i| {
                let host = (base | ((octets[3] as u32 + 1 + i as u32) & 0xff)).to_be_bytes();
                Session::empty(Ipv4Addr::from(host))
            })
            .collect();
        SessionTable {
            slots,
            server_tun_ip,
        }
    }

    pub fn find_available(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.active)
    }

    pub fn find_by_tun_ip(&self, ip: Ipv4Addr) -> Option<usize> {
        self.slots.iter().position(|s| s.active && s.tun_ip == ip)
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }

    pub fn get(&self, userid: usize) -> Option<&Session> {
        self.slots.get(userid)
    }

    pub fn get_mut(&mut self, userid: usize) -> Option<&mut Session> {
        self.slots.get_mut(userid)
    }

    /// `true` if every active-or-not slot already has a downstream payload
    /// queued — the event loop's back-pressure rule (`spec.md` §4.1).
    pub fn all_waiting_to_send(&self) -> bool {
        self.slots.iter().all(|s| s.outpacket.len > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_sequential_tun_ips() {
        let table = SessionTable::new(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(table.slots[0].tun_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(table.slots[1].tun_ip, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn find_available_returns_first_inactive_slot() {
        let mut table = SessionTable::new(Ipv4Addr::new(10, 0, 0, 1));
        table.slots[0].active = true;
        assert_eq!(table.find_available(), Some(1));
    }

    #[test]
    fn find_available_none_when_full() {
        let mut table = SessionTable::new(Ipv4Addr::new(10, 0, 0, 1));
        for s in table.slots.iter_mut() {
            s.active = true;
        }
        assert_eq!(table.find_available(), None);
    }

    #[test]
    fn find_by_tun_ip_ignores_inactive_slots() {
        let table = SessionTable::new(Ipv4Addr::new(10, 0, 0, 1));
        // Slot 1 has tun_ip 10.0.0.3 but is not active yet.
        assert_eq!(table.find_by_tun_ip(Ipv4Addr::new(10, 0, 0, 3)), None);
    }

    #[test]
    fn outpacket_single_slot_semantics() {
        let mut s = Session::empty(Ipv4Addr::new(10, 0, 0, 2));
        assert!(s.try_queue_outpacket(vec![1, 2, 3]));
        assert!(!s.try_queue_outpacket(vec![4, 5]));
        assert_eq!(s.outpacket.data, vec![1, 2, 3]);
    }

    #[test]
    fn inpacket_len_offset_stay_equal() {
        let mut s = Session::empty(Ipv4Addr::new(10, 0, 0, 2));
        s.append_upstream(b"abc");
        s.append_upstream(b"de");
        assert_eq!(s.inpacket.len, s.inpacket.offset);
        assert_eq!(s.inpacket.len, 5);
        s.finish_inpacket();
        assert_eq!(s.inpacket.len, 0);
        assert_eq!(s.inpacket.offset, 0);
    }
}
