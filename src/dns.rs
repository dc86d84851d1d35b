//! Minimal DNS wire codec.
//!
//! This is not a general-purpose DNS library: it decodes just enough of a
//! query (header id, question name as a label sequence, qtype) to drive the
//! tunnel dispatcher, and encodes just enough of an answer (one NULL or
//! mirrored-qtype record carrying an opaque payload) to reply. Anything it
//! can't parse is treated as malformed and dropped, per `spec.md` §4.2.

use std::net::SocketAddr;

/// DNS RR type NULL (RFC 1035 §3.3.10).
pub const QTYPE_NULL: u16 = 10;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LABELS: usize = 128;

/// A decoded query plus the network metadata needed to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub src_addr: SocketAddr,
    /// Original destination address, captured via ancillary control data
    /// when the OS provides it (see `netio::recv_query`). `None` on
    /// platforms/sockets where it isn't available.
    pub dst_addr: Option<SocketAddr>,
    pub id: u16,
    pub qtype: u16,
    /// Question name as a sequence of labels, in wire order, case as
    /// received (no trailing root label).
    pub labels: Vec<Vec<u8>>,
}

impl Query {
    /// The question name rendered as a dotted ASCII string, for logging.
    pub fn name_string(&self) -> String {
        self.labels
            .iter()
            .map(|l| String::from_utf8_lossy(l).into_owned())
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Parse the DNS header and first question out of a raw UDP payload.
/// Returns `None` for anything truncated, carrying zero questions, or using
/// name compression (not needed for queries this server originates or
/// receives from a well-behaved client, and rejecting it keeps this codec
/// small).
pub fn decode_query(packet: &[u8]) -> Option<Query> {
    if packet.len() < 12 {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let mut labels = Vec::new();
    loop {
        if labels.len() > MAX_NAME_LABELS {
            return None;
        }
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xc0 != 0 {
            // Compression pointer: unsupported in an inbound question.
            return None;
        }
        if len > MAX_LABEL_LEN {
            return None;
        }
        pos += 1;
        let label = packet.get(pos..pos + len)?.to_vec();
        pos += len;
        labels.push(label);
    }

    let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
    // qclass follows at pos+2..pos+4; not consulted.

    Some(Query {
        src_addr: "0.0.0.0:0".parse().unwrap(),
        dst_addr: None,
        id,
        qtype,
        labels,
    })
}

/// Encode an answer to `query` whose question section mirrors the original
/// and whose single answer record carries `payload` verbatim. `rrtype`
/// should normally be `query.qtype` (this server only ever answers the type
/// it was asked, since it only handles NULL-type tunnel queries — see
/// `classifier.rs`).
pub fn encode_answer(query: &Query, rrtype: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + 16 + payload.len() + 16);

    out.extend_from_slice(&query.id.to_be_bytes());
    out.extend_from_slice(&[0x84, 0x00]); // QR=1 AA=1, RCODE=0
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    let question_start = out.len();
    for label in &query.labels {
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0); // root
    out.extend_from_slice(&rrtype.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    let _ = question_start;

    out.extend_from_slice(&[0xc0, 0x0c]); // NAME: pointer to question at offset 12
    out.extend_from_slice(&rrtype.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
    out.extend_from_slice(&0u32.to_be_bytes()); // TTL
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_query(name_labels: &[&[u8]], qtype: u16, id: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x00]);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for label in name_labels {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label);
        }
        buf.push(0);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf
    }

    #[test]
    fn decodes_a_simple_query() {
        let packet = raw_query(&[b"abc", b"tunnel", b"example", b"com"], QTYPE_NULL, 0x1234);
        let q = decode_query(&packet).unwrap();
        assert_eq!(q.id, 0x1234);
        assert_eq!(q.qtype, QTYPE_NULL);
        assert_eq!(q.name_string(), "abc.tunnel.example.com");
    }

    #[test]
    fn rejects_truncated_packet() {
        assert!(decode_query(&[0u8; 4]).is_none());
    }

    #[test]
    fn rejects_compression_pointer() {
        let mut packet = raw_query(&[b"abc"], QTYPE_NULL, 1);
        packet[12] = 0xc0; // turn the first label length into a pointer tag
        assert!(decode_query(&packet).is_none());
    }

    #[test]
    fn encode_answer_mirrors_question_and_id() {
        let packet = raw_query(&[b"abc", b"tunnel"], QTYPE_NULL, 0xabcd);
        let q = decode_query(&packet).unwrap();
        let answer = encode_answer(&q, QTYPE_NULL, b"hello");
        assert_eq!(&answer[0..2], &0xabcdu16.to_be_bytes());
        assert_eq!(&answer[answer.len() - 5..], b"hello");
    }
}
