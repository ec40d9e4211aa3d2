use bytes::BytesMut;

mod dns;
mod mattster;

pub use dns::DnsProtocol;
pub use mattster::MattsterProtocol;

/// Message types route requests to handlers on the receiving machine. They are
/// small integers so the handler registry can be a flat array.
pub type MsgType = u8;

pub const MAX_MSG_TYPES: usize = 64;

/// Scheduling priority of a transaction, carried in every dgram so the
/// receiving side inherits it. High priority slots get constant resend backoff
/// for fast failover, low priority slots back off exponentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Niceness {
    High,
    Low,
}

/// What a dgram is, beyond its addressing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DgramKind {
    /// Request or reply payload bytes.
    Data,
    /// Coalesced acknowledgment: bit `i` of `acked` acknowledges sequence
    /// number `seq + i` of the transaction.
    Ack { acked: u64 },
    /// Single-dgram reply carrying an error code instead of payload.
    ErrorReply { code: u32 },
    /// The initiator abandoned the transaction; the receiver should drop its
    /// slot without replying.
    Cancel,
}

/// A parsed dgram header. The transport never inspects payload bytes; this is
/// everything it knows about a dgram on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DgramHeader {
    pub trans_id: u32,
    pub msg_type: MsgType,
    pub niceness: Niceness,
    /// Sequence number within the transaction. For ACKs this is the base of
    /// the acknowledgment bitmap.
    pub seq: u32,
    /// Total dgrams of the transaction. Zero for dgrams that carry no data.
    pub total: u32,
    /// Whether the dgram belongs to the request half of the transaction (sent
    /// by the initiator) or the reply half. ACKs echo the flag of the dgrams
    /// they acknowledge.
    pub is_request: bool,
    pub is_last: bool,
    pub kind: DgramKind,
    /// Offset of the payload bytes within the raw dgram.
    pub payload_offset: usize,
}

impl DgramHeader {
    pub fn is_ack(&self) -> bool {
        matches!(self.kind, DgramKind::Ack { .. })
    }

    /// An error reply acts as a negative acknowledgment of the whole
    /// transaction.
    pub fn is_nack(&self) -> bool {
        matches!(self.kind, DgramKind::ErrorReply { .. })
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self.kind, DgramKind::Cancel)
    }

    pub fn is_reply(&self) -> bool {
        !self.is_request
    }
}

/// A pluggable dgram format.
///
/// The transport treats dgrams opaquely except through this interface: parsing
/// yields a [DgramHeader] with predicates and accessors, emitting renders the
/// transport's scheduling decisions back into wire bytes. One implementation is
/// selected at init and used for the lifetime of the server.
pub trait DgramProtocol: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn header_len(&self) -> usize;

    /// Payload bytes per dgram. Messages larger than this are split across
    /// dgrams; there is no other fragmentation.
    fn max_payload(&self) -> usize;

    /// Upper bound on dgrams per transaction for this format.
    fn max_dgrams(&self) -> u32;

    /// Formats without acknowledgments (DNS) complete a send as soon as the
    /// dgram leaves the socket; retransmission is then driven purely by the
    /// reply timeout.
    fn uses_acks(&self) -> bool {
        true
    }

    /// Whether the format can express a cancel dgram.
    fn supports_cancel(&self) -> bool {
        true
    }

    /// Transaction ids are masked to the width the format can carry.
    fn trans_id_mask(&self) -> u32 {
        0x7fff_ffff
    }

    fn parse(&self, dgram: &[u8]) -> anyhow::Result<DgramHeader>;

    #[allow(clippy::too_many_arguments)]
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
    );

    /// Emits one coalesced ACK covering `base_seq .. base_seq + 64`.
    /// `for_request` states whether the acknowledged dgrams were request
    /// dgrams, so the peer can locate the matching slot.
    fn emit_ack(
        &self,
        trans_id: u32,
        msg_type: MsgType,
        for_request: bool,
        base_seq: u32,
        acked: u64,
        buf: &mut BytesMut,
    );

    fn emit_error_reply(&self, trans_id: u32, msg_type: MsgType, code: u32, buf: &mut BytesMut);

    fn emit_cancel(&self, trans_id: u32, msg_type: MsgType, buf: &mut BytesMut);
}
