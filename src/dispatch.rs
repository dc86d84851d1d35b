//! The NULL request dispatcher: the protocol state machine over the first
//! octet of a tunnel query's encoded label prefix.

use crate::auth;
use crate::classifier;
use crate::compress;
use crate::dns::Query;
use crate::encoding::Encoder;
use crate::session::{SessionTable, USERS};
use std::net::Ipv4Addr;
use std::time::Instant;

/// The server's own protocol version. Bumped whenever the wire format
/// changes in a way clients must match exactly.
pub const PROTOCOL_VERSION: u32 = 0x0000_0502;

/// Shared mutable state threaded through every handler — the single owned
/// context the event loop holds, per `spec.md` §9 ("process-wide mutable
/// state... model as a single owned context struct").
pub struct TunnelContext {
    pub sessions: SessionTable,
    pub topdomain: Vec<Vec<u8>>,
    pub password: String,
    pub check_ip: bool,
    pub mtu: u16,
}

/// One answer this dispatch pass needs to send, addressed to whichever
/// query it answers (which may be a previously parked query, not the one
/// that just arrived).
pub struct Outgoing {
    pub query: Query,
    pub payload: Vec<u8>,
}

/// Everything a single dispatch pass produced.
#[derive(Default)]
pub struct DispatchResult {
    pub answers: Vec<Outgoing>,
    /// A fully decompressed frame destined for the local TUN device.
    pub to_tun: Option<Vec<u8>>,
}

impl DispatchResult {
    fn answer(&mut self, query: Query, payload: Vec<u8>) {
        self.answers.push(Outgoing { query, payload });
    }
}

fn src_ipv4(query: &Query) -> Option<Ipv4Addr> {
    match query.src_addr.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        std::net::IpAddr::V6(_) => None,
    }
}

fn host_matches(session_host: Option<Ipv4Addr>, query: &Query) -> bool {
    match (session_host, src_ipv4(query)) {
        (Some(h), Some(q)) => h == q,
        _ => false,
    }
}

/// Flush a user's pending downstream payload to its parked query, if any.
/// Returns the flushed answer (possibly empty-payload) for the caller to
/// send, clearing both `outpacket` and the parked query id.
fn flush_parked(sessions: &mut SessionTable, userid: usize) -> Option<Outgoing> {
    let session = sessions.get_mut(userid)?;
    let parked = session.take_parked()?;
    let payload = std::mem::take(&mut session.outpacket.data);
    session.clear_outpacket();
    Some(Outgoing {
        query: parked,
        payload,
    })
}

fn handle_version(ctx: &mut TunnelContext, query: &Query, remainder: &[u8], out: &mut DispatchResult) {
    let decoded = Encoder::Base32.decode(remainder).unwrap_or_default();
    let version = if decoded.len() >= 4 {
        Some(u32::from_be_bytes([decoded[0], decoded[1], decoded[2], decoded[3]]))
    } else {
        None
    };

    if version == Some(PROTOCOL_VERSION) {
        match ctx.sessions.find_available() {
            Some(userid) => {
                let seed: u32 = rand::random();
                let host = src_ipv4(query);
                {
                    let session = ctx.sessions.get_mut(userid).expect("just located");
                    session.active = true;
                    session.seed = seed;
                    session.host = host;
                    session.encoder = Encoder::Base32;
                    session.last_pkt = Some(Instant::now());
                }
                let mut payload = Vec::with_capacity(9);
                payload.extend_from_slice(b"VACK");
                payload.extend_from_slice(&seed.to_be_bytes());
                payload.push(userid as u8);
                out.answer(query.clone(), payload);
            }
            None => {
                let mut payload = Vec::with_capacity(9);
                payload.extend_from_slice(b"VFUL");
                payload.extend_from_slice(&(USERS as u32).to_be_bytes());
                payload.push(0);
                out.answer(query.clone(), payload);
            }
        }
    } else {
        let mut payload = Vec::with_capacity(9);
        payload.extend_from_slice(b"VNAK");
        payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        payload.push(0);
        out.answer(query.clone(), payload);
    }
}

fn handle_login(
    ctx: &mut TunnelContext,
    query: &Query,
    remainder: &[u8],
    out: &mut DispatchResult,
) -> Option<usize> {
    let decoded = Encoder::Base32.decode(remainder).unwrap_or_default();
    let userid = *decoded.first()? as usize;
    if userid >= USERS {
        out.answer(query.clone(), b"BADIP".to_vec());
        return None;
    }

    let session = ctx.sessions.get_mut(userid)?;
    session.last_pkt = Some(Instant::now());

    if ctx.check_ip && !host_matches(session.host, query) {
        out.answer(query.clone(), b"BADIP".to_vec());
        return None;
    }

    if auth::verify(&ctx.password, session.seed, &decoded[1..]) {
        let server_ip = ctx.sessions.server_tun_ip;
        let user_ip = session.tun_ip;
        let reply = format!("{}-{}-{}", server_ip, user_ip, ctx.mtu);
        session.clear_parked();
        out.answer(query.clone(), reply.into_bytes());
    } else {
        out.answer(query.clone(), b"LNAK".to_vec());
    }
    // Login always answers the query synchronously, same as V/Z; returning
    // None here keeps the tail action from firing a second, spurious answer
    // if the user also has an outpacket queued.
    None
}

fn handle_ping(
    ctx: &mut TunnelContext,
    query: &Query,
    remainder: &[u8],
    out: &mut DispatchResult,
) -> Option<usize> {
    let decoded = Encoder::Base32.decode(remainder).unwrap_or_default();
    let userid = *decoded.first()? as usize;
    // The original checks range and IP-pin together here regardless of the
    // `-c` flag; preserved rather than "fixed" per spec.md's design notes.
    let in_range = userid < USERS;
    let host_ok = in_range
        && ctx
            .sessions
            .get(userid)
            .map(|s| host_matches(s.host, query))
            .unwrap_or(false);
    if !in_range || !host_ok {
        out.answer(query.clone(), b"BADIP".to_vec());
        return None;
    }

    if let Some(flushed) = flush_parked(&mut ctx.sessions, userid) {
        out.answers.push(flushed);
    }
    let session = ctx.sessions.get_mut(userid)?;
    session.park(query.clone());
    session.last_pkt = Some(Instant::now());
    Some(userid)
}

fn handle_case_probe(query: &Query, prefix: &[u8], out: &mut DispatchResult) {
    out.answer(query.clone(), prefix.to_vec());
}

/// Length of the synthetic link header every decompressed wire fragment
/// carries ahead of its IPv4 packet, matching `tun_ingress::LINK_HEADER_LEN`.
const LINK_HEADER_LEN: usize = 4;

fn extract_ipv4_dst(frame: &[u8]) -> Option<Ipv4Addr> {
    // `frame` is a decompressed wire fragment: a synthetic link header
    // followed by the IPv4 packet, so the destination address sits 4 bytes
    // past where it would in a bare, headerless packet.
    let dst = frame.get(LINK_HEADER_LEN + 16..LINK_HEADER_LEN + 20)?;
    Some(Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3]))
}

fn handle_fragment(
    ctx: &mut TunnelContext,
    query: &Query,
    code: u8,
    remainder: &[u8],
    out: &mut DispatchResult,
) -> Option<usize> {
    let userid = (code >> 1) as usize;
    if userid >= USERS {
        out.answer(query.clone(), b"BADIP".to_vec());
        return None;
    }

    if ctx.check_ip {
        let ok = ctx
            .sessions
            .get(userid)
            .map(|s| host_matches(s.host, query))
            .unwrap_or(false);
        if !ok {
            out.answer(query.clone(), b"BADIP".to_vec());
            return Some(userid);
        }
    }

    let encoder = ctx.sessions.get(userid)?.encoder;
    let decoded = encoder.decode(remainder).unwrap_or_default();

    {
        let session = ctx.sessions.get_mut(userid)?;
        session.last_pkt = Some(Instant::now());
    }
    if let Some(flushed) = flush_parked(&mut ctx.sessions, userid) {
        out.answers.push(flushed);
    }
    {
        let session = ctx.sessions.get_mut(userid)?;
        session.append_upstream(&decoded);
        session.park(query.clone());
    }

    if code & 1 != 0 {
        let compressed_fragment = {
            let session = ctx.sessions.get(userid)?;
            session.inpacket.data.clone()
        };
        if let Some(frame) = compress::decompress(&compressed_fragment) {
            match extract_ipv4_dst(&frame).and_then(|ip| ctx.sessions.find_by_tun_ip(ip)) {
                Some(touser) => {
                    let session = ctx.sessions.get_mut(touser)?;
                    if session.try_queue_outpacket(compressed_fragment) {
                        if let Some(flushed) = flush_parked(&mut ctx.sessions, touser) {
                            out.answers.push(flushed);
                        }
                    }
                }
                None => {
                    // Strip the synthetic link header before handing off to
                    // the local TUN device, which never sees it (opened
                    // IFF_NO_PI).
                    out.to_tun = Some(frame.get(LINK_HEADER_LEN..).unwrap_or(&[]).to_vec());
                }
            }
        }
        ctx.sessions.get_mut(userid)?.finish_inpacket();
    }

    Some(userid)
}

/// Run one query through the state machine. `prefix` is the tunnel-encoded
/// label prefix (see `classifier::prefix_bytes`) — its first octet is the
/// command code.
pub fn dispatch(ctx: &mut TunnelContext, query: Query, prefix: &[u8]) -> DispatchResult {
    let mut out = DispatchResult::default();
    if prefix.is_empty() {
        return out;
    }

    let command = prefix[0];
    let remainder = &prefix[1..];

    let userid = match command {
        b'V' | b'v' => {
            handle_version(ctx, &query, remainder, &mut out);
            None
        }
        b'L' | b'l' => handle_login(ctx, &query, remainder, &mut out),
        b'P' | b'p' => handle_ping(ctx, &query, remainder, &mut out),
        b'Z' | b'z' => {
            handle_case_probe(&query, prefix, &mut out);
            None
        }
        c if c.is_ascii_alphanumeric() => {
            // A single hex digit only carries 4 bits, one short of what's
            // needed to address all `USERS` slots plus a fragment-end flag
            // (5 bits: 4 for userid, 1 for the flag). Use the wider
            // base-36 alphabet and keep the low 5 bits instead. The four
            // reserved command letters never reach this arm (matched
            // above), so they're simply never produced by a compliant
            // encoder for this field.
            let digit = (c as char).to_digit(36).expect("checked is_ascii_alphanumeric") as u8;
            let code = digit & 0x1f;
            handle_fragment(ctx, &query, code, remainder, &mut out)
        }
        _ => None,
    };

    // Tail action (spec.md §4.4): flush any pending downstream payload to
    // the *current* query, for branches that didn't already answer
    // synchronously and didn't already park it elsewhere.
    if let Some(userid) = userid {
        if let Some(session) = ctx.sessions.get_mut(userid) {
            if host_matches(session.host, &query) && session.outpacket.len > 0 {
                let payload = std::mem::take(&mut session.outpacket.data);
                session.clear_outpacket();
                session.clear_parked();
                out.answer(query, payload);
            }
        }
    }

    out
}

/// Convenience wrapper combining classification and dispatch, used by the
/// event loop.
pub fn handle_query(ctx: &mut TunnelContext, query: Query) -> Option<DispatchResult> {
    let prefix_labels = classifier::prefix_label_count(&query.labels, &ctx.topdomain);
    let domain_len = classifier::classify(&query.labels, &ctx.topdomain)?;
    let prefix = classifier::prefix_bytes(&query.labels, prefix_labels);
    debug_assert_eq!(prefix.len(), domain_len);
    Some(dispatch(ctx, query, &prefix))
}
