use std::net::{IpAddr, SocketAddr};

use bytes::{Bytes, BytesMut};

use crate::protocol::{MsgType, Niceness};
use crate::server::handler::{ErrorCode, ReplyCallback, ReplyDoneCallback};
use crate::util::bitmap::DgramBitmap;

/// Milliseconds on the server's monotonic clock. Every state machine entry
/// point takes an explicit `now` so scheduling decisions are deterministic and
/// directly testable.
pub type Millis = u64;

/// A slot's hash key. Transaction ids alone are not unique across machines, so
/// the peer's endpoint is part of the key, and the direction bit keeps a
/// request we initiated apart from an incoming request that happens to carry
/// the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub trans_id: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub incoming: bool,
}

impl SlotKey {
    pub fn new(trans_id: u32, peer: SocketAddr, incoming: bool) -> SlotKey {
        SlotKey {
            trans_id,
            ip: peer.ip(),
            port: peer.port(),
            incoming,
        }
    }
}

/// Public handle to a live slot, handed to request handlers so they can reply
/// later. The generation guards against the arena entry being recycled: a
/// stale handle silently stops resolving instead of touching a stranger's
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// The per-transaction record - the rough equivalent of a socket for one
/// request/reply exchange. All slots are pre-allocated in the slot table's
/// arena and recycled through a free list; the intrusive hooks at the bottom
/// link a slot into the available, active and callback lists without
/// allocating.
pub(crate) struct UdpSlot {
    pub key: SlotKey,
    pub used: bool,
    pub generation: u32,

    pub endpoint: SocketAddr,
    pub host_id: Option<i32>,
    pub msg_type: MsgType,
    pub niceness: Niceness,
    /// Caller-chosen correlation token, matched by `cancel` and handed back in
    /// the completion.
    pub token: u64,

    // send half
    pub send_buf: Bytes,
    pub send_dgram_count: u32,
    pub sent: DgramBitmap,
    pub acked: DgramBitmap,
    /// Set when the attached single-dgram reply carries an error code rather
    /// than payload bytes.
    pub reply_error: Option<ErrorCode>,
    pub needs_resend: bool,

    // receive half
    pub recv_buf: BytesMut,
    pub recv_size: usize,
    /// Taken from the first data dgram's total; `None` until one arrives.
    pub recv_dgram_count: Option<u32>,
    pub received: DgramBitmap,
    pub acks_to_send: DgramBitmap,

    // lifecycle
    pub callback: Option<ReplyCallback>,
    pub reply_done: Option<ReplyDoneCallback>,
    pub handler_called: bool,
    pub reply_attached: bool,
    /// Whether this slot currently counts towards the requests-in-waiting
    /// counters (request fully received, reply not yet attached).
    pub counted_waiting: bool,

    // timing
    pub created_at: Millis,
    pub resend_backoff: Millis,
    pub max_backoff: Millis,
    pub next_resend_at: Millis,
    /// `None` disables the overall deadline (infinite timeout).
    pub overall_deadline: Option<Millis>,
    pub resend_count: u32,
    /// `None` allows unlimited resends.
    pub max_resends: Option<u32>,
    pub error: Option<ErrorCode>,

    pub bytes_sent: u64,
    pub bytes_received: u64,

    // intrusive list hooks, owned by the slot table
    pub(crate) next_free: Option<u32>,
    pub(crate) active_prev: Option<u32>,
    pub(crate) active_next: Option<u32>,
    pub(crate) callback_prev: Option<u32>,
    pub(crate) callback_next: Option<u32>,
    pub(crate) in_callback_list: bool,
}

impl UdpSlot {
    const VACANT_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 0);

    pub fn vacant() -> UdpSlot {
        let endpoint = SocketAddr::from(Self::VACANT_ADDR);
        UdpSlot {
            key: SlotKey::new(0, endpoint, false),
            used: false,
            generation: 0,
            endpoint,
            host_id: None,
            msg_type: 0,
            niceness: Niceness::Low,
            token: 0,
            send_buf: Bytes::new(),
            send_dgram_count: 0,
            sent: DgramBitmap::EMPTY,
            acked: DgramBitmap::EMPTY,
            reply_error: None,
            needs_resend: false,
            recv_buf: BytesMut::new(),
            recv_size: 0,
            recv_dgram_count: None,
            received: DgramBitmap::EMPTY,
            acks_to_send: DgramBitmap::EMPTY,
            callback: None,
            reply_done: None,
            handler_called: false,
            reply_attached: false,
            counted_waiting: false,
            created_at: 0,
            resend_backoff: 0,
            max_backoff: 0,
            next_resend_at: 0,
            overall_deadline: None,
            resend_count: 0,
            max_resends: None,
            error: None,
            bytes_sent: 0,
            bytes_received: 0,
            next_free: None,
            active_prev: None,
            active_next: None,
            callback_prev: None,
            callback_next: None,
            in_callback_list: false,
        }
    }

    /// Re-initializes the per-transaction state when the slot is taken off the
    /// free list. The generation is bumped on `free`, not here, so a handle to
    /// the previous incarnation is already stale by the time we get recycled.
    pub fn recycle(&mut self, key: SlotKey, endpoint: SocketAddr, now: Millis) {
        self.key = key;
        self.used = true;
        self.endpoint = endpoint;
        self.host_id = None;
        self.msg_type = 0;
        self.niceness = Niceness::Low;
        self.token = 0;
        self.send_buf = Bytes::new();
        self.send_dgram_count = 0;
        self.sent.clear_all();
        self.acked.clear_all();
        self.reply_error = None;
        self.needs_resend = false;
        self.recv_buf = BytesMut::new();
        self.recv_size = 0;
        self.recv_dgram_count = None;
        self.received.clear_all();
        self.acks_to_send.clear_all();
        self.callback = None;
        self.reply_done = None;
        self.handler_called = false;
        self.reply_attached = false;
        self.counted_waiting = false;
        self.created_at = now;
        self.resend_backoff = 0;
        self.max_backoff = 0;
        self.next_resend_at = 0;
        self.overall_deadline = None;
        self.resend_count = 0;
        self.max_resends = None;
        self.error = None;
        self.bytes_sent = 0;
        self.bytes_received = 0;
    }

    pub fn is_incoming(&self) -> bool {
        self.key.incoming
    }

    pub fn has_send_attached(&self) -> bool {
        self.send_dgram_count > 0
    }

    /// Dgrams sent but not yet acknowledged.
    pub fn send_window(&self) -> u32 {
        self.sent.count_ones() - self.acked.count_ones()
    }

    pub fn send_complete(&self) -> bool {
        self.has_send_attached() && self.acked.is_full_below(self.send_dgram_count)
    }

    pub fn recv_complete(&self) -> bool {
        match self.recv_dgram_count {
            Some(count) => self.received.is_full_below(count),
            None => false,
        }
    }

    pub fn has_unsent(&self) -> bool {
        self.has_send_attached()
            && self.sent.first_clear_below(self.send_dgram_count).is_some()
    }

    pub fn age_ms(&self, now: Millis) -> Millis {
        now.saturating_sub(self.created_at)
    }
}
