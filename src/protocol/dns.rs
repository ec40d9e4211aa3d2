use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::protocol::{DgramHeader, DgramKind, DgramProtocol, MsgType, Niceness};

/// DNS-compatible dgram format.
///
/// Maps the capability set onto plain DNS headers so the transport can talk to
/// standard resolvers: the DNS id field is the transaction id (16 bits), the QR
/// bit distinguishes request from reply, and a non-zero RCODE in a reply is
/// surfaced as an error. There are no acknowledgments and no multi-dgram
/// transactions - a resend is simply the query sent again under the same id.
///
/// The codec header covers only id and flags (4 bytes); the section counts and
/// sections are payload, so a query round-trips byte-identically through the
/// slot buffers. Callers supply everything after the flags word.
///
/// Peer RCODEs are reported as `DNS_RCODE_BASE + rcode` to keep them disjoint
/// from the transport's own error codes.
pub struct DnsProtocol;

pub const DNS_RCODE_BASE: u32 = 0x1000;

const HEADER_LEN: usize = 4;

/// Classic DNS-over-UDP message limit.
const MAX_MESSAGE: usize = 512;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_SERVFAIL: u16 = 2;

impl DgramProtocol for DnsProtocol {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn max_payload(&self) -> usize {
        MAX_MESSAGE - HEADER_LEN
    }

    fn max_dgrams(&self) -> u32 {
        1
    }

    fn uses_acks(&self) -> bool {
        false
    }

    fn supports_cancel(&self) -> bool {
        false
    }

    fn trans_id_mask(&self) -> u32 {
        0xffff
    }

    fn parse(&self, dgram: &[u8]) -> anyhow::Result<DgramHeader> {
        // require a full DNS header even though only id and flags are ours
        if dgram.len() < 12 {
            bail!("short DNS message");
        }

        let buf = &mut &dgram[..];
        let id = buf.try_get_u16()?;
        let flags = buf.try_get_u16()?;

        let is_reply = flags & FLAG_QR != 0;
        let rcode = flags & 0x000f;

        let kind = if is_reply && rcode != 0 {
            DgramKind::ErrorReply { code: DNS_RCODE_BASE + rcode as u32 }
        } else {
            DgramKind::Data
        };

        Ok(DgramHeader {
            trans_id: id as u32,
            msg_type: 0,
            niceness: Niceness::High,
            seq: 0,
            total: 1,
            is_request: !is_reply,
            is_last: true,
            kind,
            payload_offset: HEADER_LEN,
        })
    }

    fn emit_data(
        &self,
        trans_id: u32,
        _msg_type: MsgType,
        _niceness: Niceness,
        is_request: bool,
        _seq: u32,
        _total: u32,
        payload: &[u8],
        buf: &mut BytesMut,
    ) {
        let flags = if is_request { FLAG_RD } else { FLAG_QR | FLAG_RD | FLAG_RA };
        buf.put_u16(trans_id as u16);
        buf.put_u16(flags);
        buf.put_slice(payload);
    }

    fn emit_ack(
        &self,
        trans_id: u32,
        _msg_type: MsgType,
        _for_request: bool,
        _base_seq: u32,
        _acked: u64,
        _buf: &mut BytesMut,
    ) {
        debug_assert!(false, "DNS has no acknowledgments");
        tracing::error!("acknowledgment requested for transaction {} on ack-less DNS protocol", trans_id);
    }

    fn emit_error_reply(&self, trans_id: u32, _msg_type: MsgType, code: u32, buf: &mut BytesMut) {
        let rcode = if code >= DNS_RCODE_BASE && code < DNS_RCODE_BASE + 16 {
            (code - DNS_RCODE_BASE) as u16
        } else {
            RCODE_SERVFAIL
        };

        buf.put_u16(trans_id as u16);
        buf.put_u16(FLAG_QR | FLAG_RD | FLAG_RA | rcode);
        // empty question/answer/authority/additional sections
        for _ in 0..4 {
            buf.put_u16(0);
        }
    }

    fn emit_cancel(&self, trans_id: u32, _msg_type: MsgType, _buf: &mut BytesMut) {
        debug_assert!(false, "DNS has no cancel dgram");
        tracing::error!("cancel requested for transaction {} on DNS protocol", trans_id);
    }
}
