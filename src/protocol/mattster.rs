use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;

use crate::protocol::{DgramHeader, DgramKind, DgramProtocol, MsgType, Niceness, MAX_MSG_TYPES};
use crate::util::bitmap::MAX_DGRAMS;

/// The default dgram format.
///
/// Fixed 16-byte header, all numbers in network byte order:
/// ```ascii
/// 0:  CRC-32/ISCSI over everything after the checksum field (u32)
/// 4:  flags (u8):
///     * bit 0: ACK - the dgram acknowledges previously received dgrams
///     * bit 1: ERROR - single-dgram reply carrying an error code
///     * bit 2: REQUEST - the dgram belongs to the request half
///     * bit 3: LAST - highest-sequence dgram of its transaction
///     * bit 4: CANCEL - the initiator abandoned the transaction
///     * bit 5: NICE - low scheduling priority
/// 5:  message type (u8), 0..MAX_MSG_TYPES
/// 6:  sequence number (u16); for ACKs the base of the acknowledgment bitmap
/// 8:  total dgrams of the transaction (u16); 0 for non-data dgrams
/// 10: reserved, must be 0 (u16)
/// 12: transaction id (u32, positive)
/// ```
///
/// Payload follows the header. ACK dgrams carry an 8-byte bitmap acknowledging
/// sequence numbers `seq .. seq+64` (bit `i` for `seq + i`, little-endian word
/// order). Error replies carry a u32 error code. Data dgrams carry exactly
/// [Self::MAX_PAYLOAD] bytes except for the LAST dgram, which may be shorter.
pub struct MattsterProtocol;

const HEADER_LEN: usize = 16;

/// Chosen so header plus payload stay under a 1500-byte MTU with IP and UDP
/// overhead, avoiding IP-level fragmentation.
const MAX_PAYLOAD: usize = 1456;

const FLAG_ACK: u8 = 0x01;
const FLAG_ERROR: u8 = 0x02;
const FLAG_REQUEST: u8 = 0x04;
const FLAG_LAST: u8 = 0x08;
const FLAG_CANCEL: u8 = 0x10;
const FLAG_NICE: u8 = 0x20;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

impl MattsterProtocol {
    fn put_header(
        buf: &mut BytesMut,
        flags: u8,
        msg_type: MsgType,
        seq: u32,
        total: u32,
        trans_id: u32,
    ) -> usize {
        let start = buf.len();
        buf.put_u32(0); // checksum, patched in finalize
        buf.put_u8(flags);
        buf.put_u8(msg_type);
        buf.put_u16(seq as u16);
        buf.put_u16(total as u16);
        buf.put_u16(0);
        buf.put_u32(trans_id);
        start
    }

    /// Calculates the checksum over everything after the checksum field and
    /// patches it in, once header and payload are complete.
    fn finalize(buf: &mut BytesMut, start: usize) {
        let checksum = CRC32.checksum(&buf[start + 4..]);
        buf[start..start + 4].copy_from_slice(&checksum.to_be_bytes());
    }

    fn niceness_flag(niceness: Niceness) -> u8 {
        match niceness {
            Niceness::High => 0,
            Niceness::Low => FLAG_NICE,
        }
    }
}

impl DgramProtocol for MattsterProtocol {
    fn name(&self) -> &'static str {
        "mattster"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn max_payload(&self) -> usize {
        MAX_PAYLOAD
    }

    fn max_dgrams(&self) -> u32 {
        MAX_DGRAMS as u32
    }

    fn parse(&self, dgram: &[u8]) -> anyhow::Result<DgramHeader> {
        let buf = &mut &dgram[..];

        let checksum = buf.try_get_u32()?;
        if checksum != CRC32.checksum(&dgram[4..]) {
            bail!("checksum mismatch");
        }

        let flags = buf.try_get_u8()?;
        let msg_type = buf.try_get_u8()?;
        let seq = buf.try_get_u16()? as u32;
        let total = buf.try_get_u16()? as u32;
        let _reserved = buf.try_get_u16()?;
        let trans_id = buf.try_get_u32()?;

        if msg_type as usize >= MAX_MSG_TYPES {
            bail!("message type {} out of range", msg_type);
        }

        let payload = &dgram[HEADER_LEN..];
        let is_request = flags & FLAG_REQUEST != 0;
        let is_last = flags & FLAG_LAST != 0;
        let niceness = if flags & FLAG_NICE != 0 { Niceness::Low } else { Niceness::High };

        let kind = match flags & (FLAG_ACK | FLAG_ERROR | FLAG_CANCEL) {
            0 => {
                if total == 0 || total > self.max_dgrams() {
                    bail!("dgram count {} out of range", total);
                }
                if seq >= total {
                    bail!("sequence number {} beyond dgram count {}", seq, total);
                }
                if is_last != (seq + 1 == total) {
                    bail!("last-dgram flag inconsistent with sequence number");
                }
                DgramKind::Data
            }
            FLAG_ACK => {
                let acked = (&mut &payload[..]).try_get_u64_le()
                    .map_err(|_| anyhow!("short acknowledgment bitmap"))?;
                DgramKind::Ack { acked }
            }
            FLAG_ERROR => {
                let code = (&mut &payload[..]).try_get_u32()
                    .map_err(|_| anyhow!("short error code"))?;
                DgramKind::ErrorReply { code }
            }
            FLAG_CANCEL => DgramKind::Cancel,
            _ => bail!("conflicting dgram flags {:#04x}", flags),
        };

        Ok(DgramHeader {
            trans_id,
            msg_type,
            niceness,
            seq,
            total,
            is_request,
            is_last,
            kind,
            payload_offset: HEADER_LEN,
        })
    }

    fn emit_data(
        &self,
        trans_id: u32,
        msg_type: MsgType,
        niceness: Niceness,
        is_request: bool,
        seq: u32,
        total: u32,
        payload: &[u8],
        buf: &mut BytesMut,
    ) {
        let mut flags = Self::niceness_flag(niceness);
        if is_request {
            flags |= FLAG_REQUEST;
        }
        if seq + 1 == total {
            flags |= FLAG_LAST;
        }

        let start = Self::put_header(buf, flags, msg_type, seq, total, trans_id);
        buf.put_slice(payload);
        Self::finalize(buf, start);
    }

    fn emit_ack(
        &self,
        trans_id: u32,
        msg_type: MsgType,
        for_request: bool,
        base_seq: u32,
        acked: u64,
        buf: &mut BytesMut,
    ) {
        let mut flags = FLAG_ACK;
        if for_request {
            flags |= FLAG_REQUEST;
        }

        let start = Self::put_header(buf, flags, msg_type, base_seq, 0, trans_id);
        buf.put_u64_le(acked);
        Self::finalize(buf, start);
    }

    fn emit_error_reply(&self, trans_id: u32, msg_type: MsgType, code: u32, buf: &mut BytesMut) {
        let start = Self::put_header(buf, FLAG_ERROR | FLAG_LAST, msg_type, 0, 0, trans_id);
        buf.put_u32(code);
        Self::finalize(buf, start);
    }

    fn emit_cancel(&self, trans_id: u32, msg_type: MsgType, buf: &mut BytesMut) {
        let start = Self::put_header(buf, FLAG_CANCEL | FLAG_REQUEST, msg_type, 0, 0, trans_id);
        Self::finalize(buf, start);
    }
}
