//! TUN ingress path: a frame arrives from the local kernel, gets matched to
//! a tunnel user by destination address, compressed, and either queued for
//! delivery or dropped if that user already has a payload pending.

use crate::compress;
use crate::session::SessionTable;
use std::net::Ipv4Addr;

/// Result of handing one TUN frame to the dispatcher.
pub enum IngressOutcome {
    /// Queued into `userid`'s outpacket; a previously parked query for that
    /// user, if any, should now be flushed by the caller.
    Queued { userid: usize },
    /// No session currently owns this destination address.
    NoSuchUser,
    /// The destination user already has a payload queued; the frame is
    /// dropped (tunnel clients must retry — no local queueing beyond one
    /// slot, per `spec.md` §5).
    Busy,
    /// Frame too short to contain an IPv4 header; dropped.
    Malformed,
}

/// Length of the synthetic link header prepended to every wire-format
/// upstream/downstream datagram, matching what a tunnel client expects to
/// find (and strip) ahead of the IP header.
pub(crate) const LINK_HEADER_LEN: usize = 4;

fn extract_ipv4_dst(frame: &[u8]) -> Option<Ipv4Addr> {
    let dst = frame.get(16..20)?;
    Some(Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3]))
}

/// Handle one frame read from the TUN device (already stripped of its own
/// link-layer header — see `tun::Tun::read_frame`, opened `IFF_NO_PI`).
pub fn handle_frame(sessions: &mut SessionTable, frame: &[u8]) -> IngressOutcome {
    let Some(dst) = extract_ipv4_dst(frame) else {
        return IngressOutcome::Malformed;
    };
    let Some(userid) = sessions.find_by_tun_ip(dst) else {
        return IngressOutcome::NoSuchUser;
    };
    // The wire format carries a synthetic link header ahead of the IP
    // packet regardless of how the local TUN device was opened; add it
    // back before compressing for downstream delivery.
    let mut wire = Vec::with_capacity(LINK_HEADER_LEN + frame.len());
    wire.extend_from_slice(&[0u8; LINK_HEADER_LEN]);
    wire.extend_from_slice(frame);
    let compressed = compress::compress(&wire);
    let session = sessions.get_mut(userid).expect("just located");
    if session.try_queue_outpacket(compressed) {
        IngressOutcome::Queued { userid }
    } else {
        IngressOutcome::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr as Ip4;

    fn ipv4_frame(dst: Ip4) -> Vec<u8> {
        let mut frame = vec![0u8; 20];
        frame[0] = 0x45; // version 4, IHL 5
        let dst_octets = dst.octets();
        frame[16..20].copy_from_slice(&dst_octets);
        frame
    }

    #[test]
    fn queues_frame_for_known_user() {
        let mut sessions = SessionTable::new(Ip4::new(10, 0, 0, 1));
        sessions.slots[0].active = true;
        let dst = sessions.slots[0].tun_ip;
        let frame = ipv4_frame(dst);
        match handle_frame(&mut sessions, &frame) {
            IngressOutcome::Queued { userid } => assert_eq!(userid, 0),
            _ => panic!("expected Queued"),
        }
        assert!(sessions.slots[0].outpacket.len > 0);
    }

    #[test]
    fn reports_no_such_user_for_unmapped_destination() {
        let mut sessions = SessionTable::new(Ip4::new(10, 0, 0, 1));
        let frame = ipv4_frame(Ip4::new(8, 8, 8, 8));
        assert!(matches!(
            handle_frame(&mut sessions, &frame),
            IngressOutcome::NoSuchUser
        ));
    }

    #[test]
    fn reports_busy_when_outpacket_already_queued() {
        let mut sessions = SessionTable::new(Ip4::new(10, 0, 0, 1));
        sessions.slots[0].active = true;
        sessions.slots[0].try_queue_outpacket(vec![1, 2, 3]);
        let dst = sessions.slots[0].tun_ip;
        let frame = ipv4_frame(dst);
        assert!(matches!(
            handle_frame(&mut sessions, &frame),
            IngressOutcome::Busy
        ));
    }

    #[test]
    fn reports_malformed_for_short_frame() {
        let mut sessions = SessionTable::new(Ip4::new(10, 0, 0, 1));
        assert!(matches!(
            handle_frame(&mut sessions, &[0u8; 4]),
            IngressOutcome::Malformed
        ));
    }

    #[test]
    fn queued_payload_carries_a_synthetic_link_header() {
        let mut sessions = SessionTable::new(Ip4::new(10, 0, 0, 1));
        sessions.slots[0].active = true;
        let dst = sessions.slots[0].tun_ip;
        let frame = ipv4_frame(dst);
        handle_frame(&mut sessions, &frame);
        let decompressed = crate::compress::decompress(&sessions.slots[0].outpacket.data).unwrap();
        assert_eq!(decompressed.len(), LINK_HEADER_LEN + frame.len());
        assert_eq!(&decompressed[..LINK_HEADER_LEN], &[0u8; LINK_HEADER_LEN]);
        assert_eq!(&decompressed[LINK_HEADER_LEN..], &frame[..]);
    }
}
