use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::protocol::{MsgType, Niceness, MAX_MSG_TYPES};
use crate::server::core::TransportCore;
use crate::server::slot::{Millis, SlotRef};

/// Terminal per-transaction error, delivered exactly once through the
/// completion callback. Codes cross the wire in error replies as u32; codes a
/// peer sends that we do not know are surfaced verbatim as [ErrorCode::Peer].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    /// The slot's overall deadline elapsed.
    Timeout = 1,
    /// `max_resends` exceeded without the dgrams being acknowledged.
    NoAck = 2,
    Cancelled = 3,
    /// The transport was shut down urgently with the transaction in flight.
    Shutdown = 4,
    /// The peer is shutting down and no longer accepts requests.
    Closed = 5,
    /// No free slot for a new outgoing request.
    TableFull = 6,
    /// A dgram on this slot could not be reconciled with the transaction.
    Malformed = 7,
    /// The peer has no handler registered for the message type.
    HandlerAbsent = 8,
    BadMsgType = 9,
    #[num_enum(catch_all)]
    Peer(u32) = 10,
}

/// The outcome of an outgoing request, handed to its callback.
#[derive(Debug, Clone)]
pub struct Completion {
    pub token: u64,
    pub msg_type: MsgType,
    pub peer: SocketAddr,
    /// The reply bytes, or the terminal error.
    pub result: Result<Bytes, ErrorCode>,
}

/// A fully received incoming request, handed to the registered handler. The
/// handler must eventually answer through [TransportCtx::send_reply] or
/// [TransportCtx::send_error_reply], either directly or later via the public
/// server API using the retained [SlotRef].
#[derive(Debug, Clone)]
pub struct Request {
    pub slot: SlotRef,
    pub msg_type: MsgType,
    pub peer: SocketAddr,
    pub niceness: Niceness,
    pub payload: Bytes,
}

/// Completion callback of an outgoing request. Invoked at most once; the slot
/// is gone by the time it runs.
pub type ReplyCallback = Box<dyn FnOnce(&mut TransportCtx<'_>, Completion) + Send>;

/// Optional notification that a reply finished (its last dgram was
/// acknowledged) or failed.
pub type ReplyDoneCallback = Box<dyn FnOnce(&mut TransportCtx<'_>, Result<(), ErrorCode>) + Send>;

pub type RequestHandler = Arc<dyn Fn(&mut TransportCtx<'_>, Request) + Send + Sync>;

/// One optional handler per message type. Message types are small, so this is
/// a flat array rather than a map.
pub(crate) struct HandlerRegistry {
    handlers: [Option<RequestHandler>; MAX_MSG_TYPES],
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            handlers: std::array::from_fn(|_| None),
        }
    }

    pub fn register(&mut self, msg_type: MsgType, handler: RequestHandler) -> anyhow::Result<()> {
        let entry = self.handlers.get_mut(msg_type as usize)
            .ok_or_else(|| anyhow!("message type {} out of range", msg_type))?;
        if entry.is_some() {
            return Err(anyhow!("a handler for message type {} is already registered", msg_type));
        }
        *entry = Some(handler);
        Ok(())
    }

    pub fn get(&self, msg_type: MsgType) -> Option<RequestHandler> {
        self.handlers.get(msg_type as usize)?.clone()
    }

    pub fn has_handler(&self, msg_type: MsgType) -> bool {
        matches!(self.handlers.get(msg_type as usize), Some(Some(_)))
    }
}

/// Reentrancy seam for handlers and callbacks.
///
/// Both run while the transport mutex is held, so they cannot go through the
/// public (locking) server API without deadlocking. This context wraps the
/// already-locked core and routes to the `_unlocked` entry points instead;
/// anything the public API offers for driving transactions is available here.
pub struct TransportCtx<'a> {
    pub(crate) core: &'a mut TransportCore,
    pub(crate) now: Millis,
}

impl TransportCtx<'_> {
    pub fn now(&self) -> Millis {
        self.now
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        &mut self,
        msg: Bytes,
        msg_type: MsgType,
        peer: SocketAddr,
        host_id: Option<i32>,
        token: u64,
        callback: ReplyCallback,
        timeout: Option<Duration>,
        niceness: Niceness,
        max_resends: Option<u32>,
    ) -> anyhow::Result<SlotRef> {
        self.core.send_request_unlocked(
            msg, msg_type, peer, host_id, token, callback, timeout, niceness, max_resends, self.now,
        )
    }

    pub fn send_reply(&mut self, msg: Bytes, slot: SlotRef, done: Option<ReplyDoneCallback>) {
        self.core.send_reply_unlocked(msg, slot, done, self.now);
    }

    pub fn send_error_reply(&mut self, slot: SlotRef, code: ErrorCode) {
        self.core.send_error_reply_unlocked(slot, code, self.now);
    }

    pub fn cancel(&mut self, token: u64, msg_type: MsgType) {
        self.core.cancel_unlocked(token, msg_type, self.now);
    }

    pub fn num_used_slots(&self) -> usize {
        self.core.num_used_slots()
    }
}
