use std::cmp::min;
use std::collections::VecDeque;
use std::io::Write;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::protocol::{DgramHeader, DgramKind, DgramProtocol, MsgType, Niceness, MAX_MSG_TYPES};
use crate::server::handler::{
    Completion, ErrorCode, HandlerRegistry, ReplyCallback, ReplyDoneCallback, Request,
    RequestHandler, TransportCtx,
};
use crate::server::slot::{Millis, SlotKey, SlotRef, UdpSlot};
use crate::server::slot_table::SlotTable;
use crate::server::stats::{self, ServerStats, SlotStatistic};
use crate::server::{Host, ServerConfig};

/// One dgram's worth of work chosen by the send scheduler.
///
/// Picking, rendering and committing are separate steps so a `sendto` that
/// would block commits nothing: the pick is simply repeated when the socket
/// becomes writable again.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SendPlan {
    /// Head of the slot-less control queue (error replies to unknown peers,
    /// cancel notifications).
    Control,
    /// Coalesced ACK covering the slot's pending acknowledgment bits.
    Ack { slot: u32 },
    /// One data dgram of the slot's send buffer.
    Data { slot: u32, seq: u32 },
}

enum StoreOutcome {
    AlreadyFailing,
    Duplicate,
    Malformed(&'static str),
    Stored { complete: bool },
}

enum CallbackAction {
    Nothing,
    CompleteOutgoing {
        callback: Option<ReplyCallback>,
        completion: Completion,
    },
    FinishIncoming {
        done: Option<ReplyDoneCallback>,
        result: Result<(), ErrorCode>,
    },
    Dispatch {
        msg_type: MsgType,
        request: Request,
    },
}

/// The transport state machine. All of it is driven from the three external
/// signals (socket readable, socket writable, periodic tick) while the owner
/// holds the transport mutex; nothing in here blocks or allocates on the
/// per-dgram paths beyond the receive buffers themselves.
///
/// Methods named `_unlocked` are reachable re-entrantly from handlers and
/// callbacks through [TransportCtx].
pub(crate) struct TransportCore {
    proto: Arc<dyn DgramProtocol>,
    table: SlotTable,
    handlers: HandlerRegistry,
    stats: Arc<ServerStats>,

    /// Slot-less dgrams waiting for the socket: error replies to peers we
    /// refuse a slot (shutdown), and cancel notifications for slots that are
    /// already gone.
    control_queue: VecDeque<(Bytes, SocketAddr)>,

    /// Requests fully received but not yet answered, per message type.
    requests_in_waiting: [u32; MAX_MSG_TYPES],

    next_trans_id: u32,
    pub(crate) need_send: bool,
    pub(crate) is_shutting_down: bool,

    poll_time_ms: Millis,
    initial_backoff_ms: Millis,
    high_priority_backoff_ms: Millis,
    max_backoff_ms: Millis,
    incoming_timeout_ms: Millis,
    ack_window: u32,
}

impl TransportCore {
    pub fn new(proto: Arc<dyn DgramProtocol>, config: &ServerConfig, stats: Arc<ServerStats>) -> TransportCore {
        TransportCore {
            proto,
            table: SlotTable::new(config.max_slots),
            handlers: HandlerRegistry::new(),
            stats,
            control_queue: VecDeque::new(),
            requests_in_waiting: [0; MAX_MSG_TYPES],
            next_trans_id: 0,
            need_send: false,
            is_shutting_down: false,
            poll_time_ms: config.poll_time.as_millis() as Millis,
            initial_backoff_ms: config.initial_backoff.as_millis() as Millis,
            high_priority_backoff_ms: config.high_priority_backoff.as_millis() as Millis,
            max_backoff_ms: config.max_backoff.as_millis() as Millis,
            incoming_timeout_ms: config.incoming_timeout.as_millis() as Millis,
            ack_window: config.ack_window,
        }
    }

    pub fn register_handler(&mut self, msg_type: MsgType, handler: RequestHandler) -> anyhow::Result<()> {
        self.handlers.register(msg_type, handler)
    }

    pub fn has_handler(&self, msg_type: MsgType) -> bool {
        self.handlers.has_handler(msg_type)
    }

    pub fn num_used_slots(&self) -> usize {
        self.table.num_used()
    }

    pub fn num_used_slots_incoming(&self) -> usize {
        self.table.num_used_incoming()
    }

    pub fn requests_in_waiting(&self, msg_type: MsgType) -> u32 {
        self.requests_in_waiting.get(msg_type as usize).copied().unwrap_or(0)
    }

    pub fn shutdown_complete(&self) -> bool {
        self.is_shutting_down && self.table.num_used() == 0 && self.control_queue.is_empty()
    }

    /// Transaction ids are monotonic within the process lifetime, masked to
    /// the width the protocol can carry, and never zero.
    fn next_trans_id(&mut self) -> u32 {
        self.next_trans_id = self.next_trans_id.wrapping_add(1) & self.proto.trans_id_mask();
        if self.next_trans_id == 0 {
            self.next_trans_id = 1;
        }
        self.next_trans_id
    }

    fn initial_backoff_for(&self, niceness: Niceness) -> Millis {
        match niceness {
            Niceness::High => self.high_priority_backoff_ms,
            Niceness::Low => self.initial_backoff_ms,
        }
    }

    fn dgram_count_for(&self, msg_len: usize) -> u32 {
        let count = msg_len.div_ceil(self.proto.max_payload()) as u32;
        count.max(1)
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn send_request_unlocked(
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
        now: Millis,
    ) -> anyhow::Result<SlotRef> {
        if msg_type as usize >= MAX_MSG_TYPES {
            bail!("message type {} out of range", msg_type);
        }
        if self.is_shutting_down {
            bail!("transport is shutting down");
        }
        if let Some(timeout) = timeout {
            if (timeout.as_millis() as Millis) < self.poll_time_ms {
                bail!("timeout {:?} is below the poll interval", timeout);
            }
        }
        let dgram_count = self.dgram_count_for(msg.len());
        if dgram_count > self.proto.max_dgrams() {
            bail!("message of {} bytes exceeds {} dgrams", msg.len(), self.proto.max_dgrams());
        }

        // ids wrap eventually (quickly for 16-bit DNS ids), so skip ids that
        // still key a live slot to this peer
        let mut key = None;
        for _ in 0..32 {
            let candidate = SlotKey::new(self.next_trans_id(), peer, false);
            if self.table.lookup(&candidate).is_none() {
                key = Some(candidate);
                break;
            }
        }
        let key = key.ok_or_else(|| anyhow!("no unused transaction id for {}", peer))?;

        let idx = self.table.get_empty(key, peer, now)
            .ok_or_else(|| anyhow!("slot table full ({} slots)", self.table.num_used()))?;

        let backoff = self.initial_backoff_for(niceness);
        let max_backoff = self.max_backoff_ms;
        let slot = self.table.slot_mut(idx);
        slot.host_id = host_id;
        slot.msg_type = msg_type;
        slot.niceness = niceness;
        slot.token = token;
        slot.callback = Some(callback);
        slot.send_buf = msg;
        slot.send_dgram_count = dgram_count;
        slot.resend_backoff = backoff;
        slot.max_backoff = max_backoff;
        slot.next_resend_at = now + backoff;
        slot.overall_deadline = timeout.map(|t| now + t.as_millis() as Millis);
        slot.max_resends = max_resends;

        self.need_send = true;
        debug!(
            trans_id = key.trans_id, msg_type, %peer, dgram_count,
            "sending request"
        );
        Ok(self.table.slot_ref(idx))
    }

    pub fn send_reply_unlocked(
        &mut self,
        msg: Bytes,
        slot_ref: SlotRef,
        done: Option<ReplyDoneCallback>,
        now: Millis,
    ) {
        let Some(idx) = self.table.resolve(slot_ref) else {
            warn!("reply for a slot that no longer exists - dropping");
            return;
        };

        let dgram_count = self.dgram_count_for(msg.len());
        if dgram_count > self.proto.max_dgrams() {
            warn!("reply of {} bytes exceeds {} dgrams - sending error reply instead",
                msg.len(), self.proto.max_dgrams());
            self.send_error_reply_unlocked(slot_ref, ErrorCode::Malformed, now);
            return;
        }

        self.attach_reply(idx, msg, dgram_count, None, done, now);
    }

    /// Propagates an error code to the requesting machine; its callback fires
    /// with the code set. Mechanically a single-dgram reply.
    pub fn send_error_reply_unlocked(&mut self, slot_ref: SlotRef, code: ErrorCode, now: Millis) {
        let Some(idx) = self.table.resolve(slot_ref) else {
            warn!("error reply for a slot that no longer exists - dropping");
            return;
        };
        self.attach_reply(idx, Bytes::new(), 1, Some(code), None, now);
    }

    fn attach_reply(
        &mut self,
        idx: u32,
        msg: Bytes,
        dgram_count: u32,
        reply_error: Option<ErrorCode>,
        done: Option<ReplyDoneCallback>,
        now: Millis,
    ) {
        let backoff_high = self.high_priority_backoff_ms;
        let backoff_low = self.initial_backoff_ms;
        let max_backoff = self.max_backoff_ms;
        let reply_deadline = now + self.incoming_timeout_ms;

        let slot = self.table.slot_mut(idx);
        if !slot.is_incoming() || slot.reply_attached {
            warn!(trans_id = slot.key.trans_id, "slot cannot take a reply - dropping");
            return;
        }

        slot.send_buf = msg;
        slot.send_dgram_count = dgram_count;
        slot.reply_error = reply_error;
        slot.reply_attached = true;
        slot.reply_done = done;
        slot.resend_backoff = match slot.niceness {
            Niceness::High => backoff_high,
            Niceness::Low => backoff_low,
        };
        slot.max_backoff = max_backoff;
        slot.next_resend_at = now + slot.resend_backoff;
        // the request phase deadline no longer applies; give the reply its own
        slot.overall_deadline = Some(reply_deadline);

        let msg_type = slot.msg_type;
        let trans_id = slot.key.trans_id;
        if slot.counted_waiting {
            slot.counted_waiting = false;
            self.requests_in_waiting[msg_type as usize] -= 1;
        }

        self.need_send = true;
        debug!(trans_id, msg_type, dgram_count, error = ?reply_error, "sending reply");
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// Handles one dgram read off the socket.
    pub fn handle_dgram(&mut self, dgram: &[u8], from: SocketAddr, now: Millis) {
        let header = match self.proto.parse(dgram) {
            Ok(header) => header,
            Err(e) => {
                warn!(%from, "dropping malformed dgram: {}", e);
                self.stats.record_dropped();
                return;
            }
        };

        trace!(%from, ?header, "received dgram");

        // The direction bit of the key: data dgrams of a request (and cancels)
        // belong to an incoming slot, ACKs for dgrams of a request belong to
        // the outgoing slot that sent them, and vice versa for the reply half.
        let incoming = header.is_request != header.is_ack();
        let key = SlotKey::new(header.trans_id, from, incoming);

        match header.kind {
            DgramKind::Ack { acked } => self.on_ack(&key, header.seq, acked, now),
            DgramKind::Data => self.on_data(&key, &header, dgram, from, now),
            DgramKind::ErrorReply { code } => self.on_error_reply(&key, code),
            DgramKind::Cancel => self.on_cancel(&key),
        }
    }

    fn on_ack(&mut self, key: &SlotKey, base: u32, acked: u64, _now: Millis) {
        let Some(idx) = self.table.lookup(key) else {
            trace!(trans_id = key.trans_id, "ACK for unknown transaction - ignoring");
            return;
        };

        {
            let slot = self.table.slot_mut(idx);
            if !slot.has_send_attached() {
                trace!(trans_id = key.trans_id, "ACK for a slot with nothing sent - ignoring");
                return;
            }
            let bound = slot.send_dgram_count;
            slot.acked.set_window(base, acked, bound);
            // an acknowledged dgram never needs (re)sending
            slot.sent.set_window(base, acked, bound);
            if slot.has_unsent() {
                // acknowledgments opened the window for further dgrams
                self.need_send = true;
            }
        }
        self.check_slot_done(idx);
    }

    fn on_data(&mut self, key: &SlotKey, header: &DgramHeader, dgram: &[u8], from: SocketAddr, now: Millis) {
        let idx = match self.table.lookup(key) {
            Some(idx) => idx,
            None if !key.incoming => {
                // a reply for a transaction we no longer hold (completed,
                // cancelled or timed out). Still acknowledge it so a peer
                // whose final ACK got lost can tear down its slot instead of
                // resending the reply until its deadline. Requests are never
                // acked this way - a dropped request must be retransmitted.
                trace!(trans_id = key.trans_id, "reply dgram for unknown transaction - dropping");
                if self.proto.uses_acks() {
                    self.queue_ack_dgram(header, from);
                }
                self.stats.record_dropped();
                return;
            }
            None => {
                if self.is_shutting_down {
                    self.queue_error_dgram(header, from, ErrorCode::Closed);
                    return;
                }
                match self.table.get_empty(*key, from, now) {
                    None => {
                        // the peer will retransmit once we have capacity again
                        warn!(%from, "slot table full - dropping request dgram");
                        self.stats.record_dropped();
                        return;
                    }
                    Some(idx) => {
                        let backoff = self.initial_backoff_for(header.niceness);
                        let max_backoff = self.max_backoff_ms;
                        let deadline = now + self.incoming_timeout_ms;
                        let slot = self.table.slot_mut(idx);
                        slot.msg_type = header.msg_type;
                        slot.niceness = header.niceness;
                        slot.resend_backoff = backoff;
                        slot.max_backoff = max_backoff;
                        slot.next_resend_at = now + backoff;
                        slot.overall_deadline = Some(deadline);
                        self.publish_incoming_count();
                        debug!(trans_id = key.trans_id, %from, "new incoming request");
                        idx
                    }
                }
            }
        };

        let uses_acks = self.proto.uses_acks();
        let max_payload = self.proto.max_payload();
        let outcome = {
            let slot = self.table.slot_mut(idx);
            Self::store_data_dgram(slot, header, dgram, max_payload, uses_acks)
        };

        match outcome {
            StoreOutcome::AlreadyFailing => {}
            StoreOutcome::Duplicate => {
                // idempotent beyond re-acknowledging
                trace!(trans_id = key.trans_id, seq = header.seq, "duplicate dgram - re-acknowledging");
                if uses_acks {
                    self.need_send = true;
                }
            }
            StoreOutcome::Malformed(reason) => {
                warn!(trans_id = key.trans_id, "dgram inconsistent with its transaction ({}) - failing slot", reason);
                self.fail_slot(idx, ErrorCode::Malformed);
            }
            StoreOutcome::Stored { complete } => {
                if uses_acks {
                    self.need_send = true;
                }
                if complete {
                    self.on_receive_complete(idx, key.incoming);
                }
            }
        }
    }

    fn store_data_dgram(
        slot: &mut UdpSlot,
        header: &DgramHeader,
        dgram: &[u8],
        max_payload: usize,
        uses_acks: bool,
    ) -> StoreOutcome {
        if slot.error.is_some() {
            return StoreOutcome::AlreadyFailing;
        }

        match slot.recv_dgram_count {
            None => {
                slot.recv_dgram_count = Some(header.total);
                slot.recv_buf = BytesMut::zeroed(header.total as usize * max_payload);
            }
            Some(existing) if existing != header.total => {
                return StoreOutcome::Malformed("dgram count changed mid-transaction");
            }
            Some(_) => {}
        }

        if slot.received.get(header.seq) {
            if uses_acks {
                slot.acks_to_send.set(header.seq);
            }
            return StoreOutcome::Duplicate;
        }

        let payload = &dgram[header.payload_offset..];
        // payload offsets are seq * max_payload, so only the last dgram may be
        // short
        if !header.is_last && payload.len() != max_payload {
            return StoreOutcome::Malformed("non-final dgram with partial payload");
        }
        if payload.len() > max_payload {
            return StoreOutcome::Malformed("oversized payload");
        }

        let offset = header.seq as usize * max_payload;
        slot.recv_buf[offset..offset + payload.len()].copy_from_slice(payload);
        if header.is_last {
            slot.recv_size = offset + payload.len();
        }
        slot.received.set(header.seq);
        slot.bytes_received += dgram.len() as u64;
        if uses_acks {
            slot.acks_to_send.set(header.seq);
        }

        let complete = slot.recv_complete();
        if complete {
            let recv_size = slot.recv_size;
            slot.recv_buf.truncate(recv_size);
        }
        StoreOutcome::Stored { complete }
    }

    fn on_receive_complete(&mut self, idx: u32, incoming: bool) {
        if !incoming {
            // reply complete; the slot finishes once our own send is acked too
            self.check_slot_done(idx);
            return;
        }

        let msg_type = {
            let slot = self.table.slot_mut(idx);
            if slot.handler_called || slot.counted_waiting {
                return;
            }
            slot.counted_waiting = true;
            slot.msg_type
        };
        self.requests_in_waiting[msg_type as usize] += 1;
        // the handler runs from the callback pass, never from the read site
        self.table.add_to_callback_list(idx);
        debug!(msg_type, "request fully received");
    }

    fn on_error_reply(&mut self, key: &SlotKey, code: u32) {
        let Some(idx) = self.table.lookup(key) else {
            trace!(trans_id = key.trans_id, "error reply for unknown transaction - dropping");
            self.stats.record_dropped();
            return;
        };
        debug!(trans_id = key.trans_id, code, "peer answered with an error");
        self.fail_slot(idx, ErrorCode::from(code));
    }

    fn on_cancel(&mut self, key: &SlotKey) {
        let Some(idx) = self.table.lookup(key) else {
            trace!(trans_id = key.trans_id, "cancel for unknown transaction - ignoring");
            return;
        };
        debug!(trans_id = key.trans_id, "peer cancelled the transaction");
        self.fail_slot(idx, ErrorCode::Cancelled);
    }

    /// Queues a slot-less error reply, used when we refuse to allocate a slot
    /// for a new request during shutdown.
    fn queue_error_dgram(&mut self, header: &DgramHeader, to: SocketAddr, code: ErrorCode) {
        let mut buf = BytesMut::with_capacity(self.proto.header_len() + 4);
        self.proto.emit_error_reply(header.trans_id, header.msg_type, code.into(), &mut buf);
        self.control_queue.push_back((buf.freeze(), to));
        self.need_send = true;
    }

    /// Queues a slot-less acknowledgment for a single dgram.
    fn queue_ack_dgram(&mut self, header: &DgramHeader, to: SocketAddr) {
        let mut buf = BytesMut::with_capacity(self.proto.header_len() + 8);
        self.proto.emit_ack(header.trans_id, header.msg_type, header.is_request, header.seq, 1, &mut buf);
        self.control_queue.push_back((buf.freeze(), to));
        self.need_send = true;
    }

    // ------------------------------------------------------------------
    // send scheduling
    // ------------------------------------------------------------------

    /// Picks the next single dgram to put on the wire, or `None` when no slot
    /// has work. Fairness: pending ACKs drain first (they are cheap and
    /// unblock the peer), then among data dgrams resends win, then the slot
    /// most caught up with its acknowledgments, high priority before low,
    /// FIFO on ties. A slot at the ACK window bound is never picked.
    pub fn pick_best_send(&mut self, _now: Millis) -> Option<SendPlan> {
        if !self.control_queue.is_empty() {
            return Some(SendPlan::Control);
        }

        struct Candidate {
            idx: u32,
            seq: u32,
            resend: bool,
            window: u32,
            niceness: Niceness,
        }

        let mut best: Option<Candidate> = None;
        let mut cur = self.table.active_head();
        while let Some(idx) = cur {
            let slot = self.table.slot(idx);
            cur = slot.active_next;

            if slot.error.is_some() {
                continue;
            }
            if slot.acks_to_send.any_set() {
                return Some(SendPlan::Ack { slot: idx });
            }
            if !slot.has_send_attached() {
                continue;
            }
            let Some(seq) = slot.sent.first_clear_below(slot.send_dgram_count) else {
                continue;
            };
            let window = slot.send_window();
            if window >= self.ack_window {
                continue;
            }

            let candidate = Candidate {
                idx,
                seq,
                resend: slot.needs_resend,
                window,
                niceness: slot.niceness,
            };
            let beats = match &best {
                None => true,
                Some(best) => {
                    if candidate.resend != best.resend {
                        candidate.resend
                    } else if candidate.window != best.window {
                        candidate.window < best.window
                    } else if candidate.niceness != best.niceness {
                        candidate.niceness < best.niceness
                    } else {
                        false // FIFO active-list order wins ties
                    }
                }
            };
            if beats {
                best = Some(candidate);
            }
        }

        best.map(|c| SendPlan::Data { slot: c.idx, seq: c.seq })
    }

    /// Renders the picked dgram. Read-only: a send that would block simply
    /// abandons the plan.
    pub fn build_dgram(&self, plan: &SendPlan) -> (Bytes, SocketAddr) {
        match *plan {
            SendPlan::Control => {
                let (dgram, to) = self.control_queue.front()
                    .expect("control plan without queued dgram");
                (dgram.clone(), *to)
            }
            SendPlan::Ack { slot: idx } => {
                let slot = self.table.slot(idx);
                let base = slot.acks_to_send.first_set()
                    .expect("ack plan without pending acknowledgment bits");
                let bits = slot.acks_to_send.window_from(base);
                let mut buf = BytesMut::with_capacity(self.proto.header_len() + 8);
                self.proto.emit_ack(
                    slot.key.trans_id,
                    slot.msg_type,
                    slot.is_incoming(),
                    base,
                    bits,
                    &mut buf,
                );
                (buf.freeze(), slot.endpoint)
            }
            SendPlan::Data { slot: idx, seq } => {
                let slot = self.table.slot(idx);
                let mut buf = BytesMut::with_capacity(self.proto.header_len() + self.proto.max_payload());
                if let Some(code) = slot.reply_error {
                    self.proto.emit_error_reply(slot.key.trans_id, slot.msg_type, code.into(), &mut buf);
                } else {
                    let max_payload = self.proto.max_payload();
                    let start = seq as usize * max_payload;
                    let end = min(start + max_payload, slot.send_buf.len());
                    self.proto.emit_data(
                        slot.key.trans_id,
                        slot.msg_type,
                        slot.niceness,
                        !slot.is_incoming(),
                        seq,
                        slot.send_dgram_count,
                        &slot.send_buf[start..end],
                        &mut buf,
                    );
                }
                (buf.freeze(), slot.endpoint)
            }
        }
    }

    /// Commits the bitmap and clock effects of a dgram that actually left the
    /// socket.
    pub fn commit_send(&mut self, plan: &SendPlan, wire_len: usize, now: Millis) {
        match *plan {
            SendPlan::Control => {
                self.control_queue.pop_front();
            }
            SendPlan::Ack { slot: idx } => {
                let slot = self.table.slot_mut(idx);
                let base = slot.acks_to_send.first_set()
                    .expect("ack plan without pending acknowledgment bits");
                let bits = slot.acks_to_send.window_from(base);
                slot.acks_to_send.clear_window(base, bits);
                slot.bytes_sent += wire_len as u64;
            }
            SendPlan::Data { slot: idx, seq } => {
                let uses_acks = self.proto.uses_acks();
                {
                    let slot = self.table.slot_mut(idx);
                    slot.sent.set(seq);
                    slot.bytes_sent += wire_len as u64;
                    // ack-less protocols and error replies are fire-and-forget:
                    // completion is implied by the dgram leaving the socket
                    if !uses_acks || slot.reply_error.is_some() {
                        slot.acked.set(seq);
                    }
                    slot.next_resend_at = now + slot.resend_backoff;
                    if slot.needs_resend && !slot.has_unsent() {
                        slot.needs_resend = false;
                    }
                    trace!(trans_id = slot.key.trans_id, seq, "dgram sent");
                }
                self.check_slot_done(idx);
            }
        }
    }

    // ------------------------------------------------------------------
    // timer
    // ------------------------------------------------------------------

    /// The periodic tick: scans active slots for elapsed deadlines and resend
    /// timers.
    pub fn time_pass(&mut self, now: Millis) {
        let mut cur = self.table.active_head();
        while let Some(idx) = cur {
            cur = self.table.slot(idx).active_next;
            self.tick_slot(idx, now);
        }
    }

    fn tick_slot(&mut self, idx: u32, now: Millis) {
        let (deadline_hit, resend_due) = {
            let slot = self.table.slot(idx);
            if slot.error.is_some() {
                return;
            }
            let deadline_hit = matches!(slot.overall_deadline, Some(d) if now > d);
            let resend_due = !deadline_hit
                && slot.has_send_attached()
                && slot.send_window() > 0
                && now >= slot.next_resend_at;
            (deadline_hit, resend_due)
        };

        if deadline_hit {
            debug!(trans_id = self.table.slot(idx).key.trans_id, "slot deadline elapsed");
            self.fail_slot(idx, ErrorCode::Timeout);
            return;
        }
        if !resend_due {
            return;
        }

        let exceeded = {
            let slot = self.table.slot_mut(idx);
            slot.resend_count += 1;
            matches!(slot.max_resends, Some(max) if slot.resend_count > max)
        };
        if exceeded {
            debug!(trans_id = self.table.slot(idx).key.trans_id, "resend limit exceeded without acknowledgment");
            self.fail_slot(idx, ErrorCode::NoAck);
            return;
        }

        let slot = self.table.slot_mut(idx);
        // re-mark unacknowledged dgrams unsent; the send pass re-emits them
        slot.sent = slot.acked;
        slot.needs_resend = true;
        // high priority keeps a constant backoff for fast failover
        if slot.niceness == Niceness::Low {
            slot.resend_backoff = min(slot.resend_backoff * 2, slot.max_backoff);
        }
        slot.next_resend_at = now + slot.resend_backoff;
        trace!(
            trans_id = slot.key.trans_id,
            resend_count = slot.resend_count,
            backoff_ms = slot.resend_backoff,
            "marking unacknowledged dgrams for resend"
        );
        self.need_send = true;
    }

    // ------------------------------------------------------------------
    // completion & callbacks
    // ------------------------------------------------------------------

    fn fail_slot(&mut self, idx: u32, code: ErrorCode) {
        let slot = self.table.slot_mut(idx);
        if slot.error.is_some() {
            return;
        }
        slot.error = Some(code);
        debug!(trans_id = slot.key.trans_id, ?code, "transaction failed");
        self.table.add_to_callback_list(idx);
    }

    fn check_slot_done(&mut self, idx: u32) {
        let slot = self.table.slot(idx);
        if slot.error.is_some() {
            return;
        }
        let done = if slot.is_incoming() {
            slot.reply_attached && slot.send_complete()
        } else {
            slot.send_complete() && slot.recv_complete()
        };
        if done {
            self.table.add_to_callback_list(idx);
        }
    }

    /// Walks the callback list FIFO and delivers terminal state: completed
    /// outgoing requests, failed slots, finished replies, and fully received
    /// incoming requests (which dispatch to their registered handler here,
    /// never from the read site).
    ///
    /// Slots are destroyed *before* their callback runs so a reentrant call
    /// cannot resurrect or double-free them; the completion owns all data the
    /// callback needs. Handlers run with the slot alive, since the slot must
    /// carry the reply afterwards.
    pub fn callback_pass(&mut self, now: Millis) {
        while let Some(idx) = self.table.pop_callback_head() {
            self.run_callback(idx, now);
        }
    }

    fn run_callback(&mut self, idx: u32, now: Millis) {
        let action = {
            let slot = self.table.slot_mut(idx);
            if !slot.used {
                CallbackAction::Nothing
            } else if let Some(code) = slot.error {
                if slot.is_incoming() {
                    CallbackAction::FinishIncoming {
                        done: slot.reply_done.take(),
                        result: Err(code),
                    }
                } else {
                    CallbackAction::CompleteOutgoing {
                        callback: slot.callback.take(),
                        completion: Completion {
                            token: slot.token,
                            msg_type: slot.msg_type,
                            peer: slot.endpoint,
                            result: Err(code),
                        },
                    }
                }
            } else if slot.is_incoming() {
                if !slot.handler_called && slot.recv_complete() {
                    slot.handler_called = true;
                    let generation = slot.generation;
                    CallbackAction::Dispatch {
                        msg_type: slot.msg_type,
                        request: Request {
                            slot: SlotRef { index: idx, generation },
                            msg_type: slot.msg_type,
                            peer: slot.endpoint,
                            niceness: slot.niceness,
                            payload: mem::take(&mut slot.recv_buf).freeze(),
                        },
                    }
                } else if slot.reply_attached && slot.send_complete() {
                    CallbackAction::FinishIncoming {
                        done: slot.reply_done.take(),
                        result: Ok(()),
                    }
                } else {
                    CallbackAction::Nothing
                }
            } else if slot.send_complete() && slot.recv_complete() {
                CallbackAction::CompleteOutgoing {
                    callback: slot.callback.take(),
                    completion: Completion {
                        token: slot.token,
                        msg_type: slot.msg_type,
                        peer: slot.endpoint,
                        result: Ok(mem::take(&mut slot.recv_buf).freeze()),
                    },
                }
            } else {
                CallbackAction::Nothing
            }
        };

        match action {
            CallbackAction::Nothing => {}
            CallbackAction::CompleteOutgoing { callback, completion } => {
                self.destroy_slot_unlocked(idx);
                if let Some(callback) = callback {
                    callback(&mut TransportCtx { core: self, now }, completion);
                }
            }
            CallbackAction::FinishIncoming { done, result } => {
                self.destroy_slot_unlocked(idx);
                if let Some(done) = done {
                    done(&mut TransportCtx { core: self, now }, result);
                }
            }
            CallbackAction::Dispatch { msg_type, request } => {
                match self.handlers.get(msg_type) {
                    Some(handler) => {
                        trace!(msg_type, "dispatching request to handler");
                        handler(&mut TransportCtx { core: self, now }, request);
                    }
                    None => {
                        warn!(msg_type, "no handler registered - sending error reply");
                        let slot_ref = request.slot;
                        self.send_error_reply_unlocked(slot_ref, ErrorCode::HandlerAbsent, now);
                    }
                }
            }
        }
    }

    fn destroy_slot_unlocked(&mut self, idx: u32) {
        let slot = self.table.slot(idx);
        if slot.counted_waiting {
            self.requests_in_waiting[slot.msg_type as usize] -= 1;
        }
        self.table.free(idx);
        self.publish_incoming_count();
    }

    fn publish_incoming_count(&self) {
        self.stats.used_slots_incoming
            .store(self.table.num_used_incoming() as i64, std::sync::atomic::Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // cancellation, host replacement, shutdown
    // ------------------------------------------------------------------

    /// Fails every outgoing slot matching the caller's token and message type
    /// with a cancellation error. Late ACKs or replies for those transactions
    /// find no slot and are dropped. A best-effort cancel dgram tells the
    /// peer to drop its side.
    pub fn cancel_unlocked(&mut self, token: u64, msg_type: MsgType, _now: Millis) {
        let mut cancelled = 0u32;
        let mut cur = self.table.active_head();
        while let Some(idx) = cur {
            cur = self.table.slot(idx).active_next;

            let matches = {
                let slot = self.table.slot(idx);
                !slot.is_incoming()
                    && slot.error.is_none()
                    && slot.token == token
                    && slot.msg_type == msg_type
            };
            if !matches {
                continue;
            }

            if self.proto.supports_cancel() {
                let (trans_id, endpoint) = {
                    let slot = self.table.slot(idx);
                    (slot.key.trans_id, slot.endpoint)
                };
                let mut buf = BytesMut::with_capacity(self.proto.header_len());
                self.proto.emit_cancel(trans_id, msg_type, &mut buf);
                self.control_queue.push_back((buf.freeze(), endpoint));
                self.need_send = true;
            }

            self.fail_slot(idx, ErrorCode::Cancelled);
            cancelled += 1;
        }
        debug!(token, msg_type, cancelled, "cancelled transactions");
    }

    /// Rewrites the endpoint of every slot bound to the old host id, so
    /// in-flight transactions follow a host that moved. Transaction ids and
    /// bitmaps are untouched; the slots are re-keyed so dgrams arriving from
    /// the new address resolve.
    pub fn replace_host_unlocked(&mut self, old: &Host, new: &Host) {
        let mut moved = 0u32;
        let mut cur = self.table.active_head();
        while let Some(idx) = cur {
            cur = self.table.slot(idx).active_next;

            if self.table.slot(idx).host_id != Some(old.host_id) {
                continue;
            }
            let old_key = self.table.slot(idx).key;
            let new_key = SlotKey::new(old_key.trans_id, new.addr, old_key.incoming);
            self.table.rekey(idx, new_key, new.addr);
            self.table.slot_mut(idx).host_id = Some(new.host_id);
            moved += 1;
        }
        info!(old_host = old.host_id, new_host = new.host_id, moved, "replaced host on active slots");
    }

    /// Urgent shutdown fails everything in flight; graceful shutdown only
    /// stops accepting new incoming requests (they get a `Closed` error
    /// reply) and lets active slots complete or time out.
    pub fn shutdown_unlocked(&mut self, urgent: bool, _now: Millis) {
        self.is_shutting_down = true;
        info!(urgent, "shutting down transport");
        if !urgent {
            return;
        }
        let mut cur = self.table.active_head();
        while let Some(idx) = cur {
            cur = self.table.slot(idx).active_next;
            self.fail_slot(idx, ErrorCode::Shutdown);
        }
        self.control_queue.clear();
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    fn slot_statistic(&self, idx: u32, now: Millis) -> SlotStatistic {
        let slot = self.table.slot(idx);
        SlotStatistic {
            trans_id: slot.key.trans_id,
            peer: slot.endpoint,
            msg_type: slot.msg_type,
            incoming: slot.is_incoming(),
            niceness: slot.niceness,
            age_ms: slot.age_ms(now),
            send_dgram_count: slot.send_dgram_count,
            recv_dgram_count: slot.recv_dgram_count.unwrap_or(0),
            sent_dgrams: slot.sent.count_ones(),
            acked_dgrams: slot.acked.count_ones(),
            received_dgrams: slot.received.count_ones(),
            bytes_sent: slot.bytes_sent,
            bytes_received: slot.bytes_received,
            resend_count: slot.resend_count,
        }
    }

    pub fn get_statistics(&self, now: Millis) -> Vec<SlotStatistic> {
        let mut result = Vec::with_capacity(self.table.num_used());
        let mut cur = self.table.active_head();
        while let Some(idx) = cur {
            result.push(self.slot_statistic(idx, now));
            cur = self.table.slot(idx).active_next;
        }
        result
    }

    /// Writes the versioned snapshot of active slots, optionally filtered by
    /// message type, for post-mortem diagnostics on shutdown.
    pub fn save_active_slots(
        &self,
        out: &mut dyn Write,
        msg_type: Option<MsgType>,
        now: Millis,
    ) -> anyhow::Result<()> {
        let slots: Vec<SlotStatistic> = self.get_statistics(now).into_iter()
            .filter(|s| msg_type.map(|t| t == s.msg_type).unwrap_or(true))
            .collect();
        stats::write_snapshot(out, &slots)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::sync::Mutex;

    use rstest::rstest;

    use crate::protocol::{DnsProtocol, MattsterProtocol};

    use super::*;

    fn test_config(max_slots: usize) -> ServerConfig {
        let mut config = ServerConfig::new();
        config.max_slots = max_slots;
        config
    }

    fn new_core(proto: Arc<dyn DgramProtocol>, max_slots: usize) -> (TransportCore, Arc<ServerStats>) {
        let stats = Arc::new(ServerStats::new(None, None));
        (TransportCore::new(proto, &test_config(max_slots), stats.clone()), stats)
    }

    fn capture() -> (ReplyCallback, Arc<Mutex<Vec<Completion>>>) {
        let completions = Arc::new(Mutex::new(Vec::new()));
        let sink = completions.clone();
        let callback: ReplyCallback = Box::new(move |_ctx, completion| {
            sink.lock().unwrap().push(completion);
        });
        (callback, completions)
    }

    /// Two cores wired buffer-to-buffer, with a filter that can observe and
    /// drop dgrams in either direction. Since the state machine takes
    /// explicit timestamps and the send path separates pick/build/commit,
    /// lossy multi-round exchanges run fully deterministically.
    struct TestPair {
        client: TransportCore,
        client_stats: Arc<ServerStats>,
        server: TransportCore,
        server_stats: Arc<ServerStats>,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    }

    impl TestPair {
        fn new() -> TestPair {
            Self::with_protocol(Arc::new(MattsterProtocol))
        }

        fn with_protocol(proto: Arc<dyn DgramProtocol>) -> TestPair {
            let (client, client_stats) = new_core(proto.clone(), 64);
            let (server, server_stats) = new_core(proto, 64);
            TestPair {
                client,
                client_stats,
                server,
                server_stats,
                client_addr: SocketAddr::from_str("127.0.0.1:1111").unwrap(),
                server_addr: SocketAddr::from_str("127.0.0.2:2222").unwrap(),
            }
        }

        /// Exchanges dgrams until neither side has work. Each side sends
        /// before it runs callbacks, like the real scheduling pass, so
        /// acknowledgments reach the wire before slots are torn down.
        /// `filter(from_client, dgram)` returns true to drop the dgram.
        fn pump_filtered(&mut self, now: Millis, filter: &mut dyn FnMut(bool, &[u8]) -> bool) {
            loop {
                let mut progressed = false;

                while let Some(plan) = self.client.pick_best_send(now) {
                    let (dgram, to) = self.client.build_dgram(&plan);
                    self.client.commit_send(&plan, dgram.len(), now);
                    progressed = true;
                    if to == self.server_addr && !filter(true, &dgram) {
                        self.server.handle_dgram(&dgram, self.client_addr, now);
                    }
                }
                self.client.callback_pass(now);

                while let Some(plan) = self.server.pick_best_send(now) {
                    let (dgram, to) = self.server.build_dgram(&plan);
                    self.server.commit_send(&plan, dgram.len(), now);
                    progressed = true;
                    if to == self.client_addr && !filter(false, &dgram) {
                        self.client.handle_dgram(&dgram, self.server_addr, now);
                    }
                }
                self.server.callback_pass(now);

                if !progressed {
                    break;
                }
            }
        }

        fn pump(&mut self, now: Millis) {
            self.pump_filtered(now, &mut |_, _| false);
        }

        fn send_request(
            &mut self,
            msg: Bytes,
            msg_type: MsgType,
            token: u64,
            callback: ReplyCallback,
            timeout: Option<Duration>,
            niceness: Niceness,
            max_resends: Option<u32>,
            now: Millis,
        ) -> SlotRef {
            self.client
                .send_request_unlocked(
                    msg, msg_type, self.server_addr, None, token, callback, timeout, niceness,
                    max_resends, now,
                )
                .unwrap()
        }
    }

    fn register_echo(pair: &mut TestPair, msg_type: MsgType) -> Arc<Mutex<Option<Bytes>>> {
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = seen.clone();
        pair.server
            .register_handler(msg_type, Arc::new(move |ctx: &mut TransportCtx<'_>, request: Request| {
                *seen_in_handler.lock().unwrap() = Some(request.payload.clone());
                ctx.send_reply(request.payload, request.slot, None);
            }))
            .unwrap();
        seen
    }

    #[rstest]
    fn test_single_dgram_echo_wire_counts() {
        let mut pair = TestPair::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = seen.clone();
        pair.server
            .register_handler(7, Arc::new(move |ctx: &mut TransportCtx<'_>, request: Request| {
                *seen_in_handler.lock().unwrap() = Some(request.payload.clone());
                ctx.send_reply(Bytes::from(vec![0x5a; 200]), request.slot, None);
            }))
            .unwrap();

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from(vec![1u8; 100]), 7, 1, callback,
            Some(Duration::from_secs(60)), Niceness::Low, None, 0,
        );

        let proto = MattsterProtocol;
        let mut request_dgrams = 0;
        let mut reply_dgrams = 0;
        let mut acks = 0;
        pair.pump_filtered(0, &mut |_, dgram| {
            let header = proto.parse(dgram).unwrap();
            match header.kind {
                DgramKind::Data if header.is_request => request_dgrams += 1,
                DgramKind::Data => reply_dgrams += 1,
                DgramKind::Ack { .. } => acks += 1,
                _ => {}
            }
            false
        });

        // exactly one request dgram, one reply dgram and two ACKs under no loss
        assert_eq!((request_dgrams, reply_dgrams, acks), (1, 1, 2));

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].token, 1);
        assert_eq!(completions[0].msg_type, 7);
        assert_eq!(completions[0].result.as_ref().unwrap().len(), 200);

        assert_eq!(seen.lock().unwrap().as_ref().unwrap().len(), 100);
        assert_eq!(pair.client.num_used_slots(), 0);
        assert_eq!(pair.server.num_used_slots(), 0);
        assert_eq!(pair.server.num_used_slots_incoming(), 0);
    }

    #[rstest]
    fn test_multi_dgram_with_single_loss() {
        let mut pair = TestPair::new();
        let seen = register_echo(&mut pair, 12);

        let msg: Vec<u8> = (0..32 * 1024).map(|i| (i % 251) as u8).collect();
        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from(msg.clone()), 12, 2, callback,
            Some(Duration::from_secs(60)), Niceness::Low, None, 0,
        );

        let proto = MattsterProtocol;
        let mut dgram_3_transmissions = 0;
        let mut dropped_once = false;
        let mut filter = |from_client: bool, dgram: &[u8]| {
            if !from_client {
                return false;
            }
            let header = proto.parse(dgram).unwrap();
            if header.kind == DgramKind::Data && header.is_request && header.seq == 2 {
                dgram_3_transmissions += 1;
                if !dropped_once {
                    dropped_once = true;
                    return true;
                }
            }
            false
        };

        pair.pump_filtered(0, &mut filter);
        assert!(completions.lock().unwrap().is_empty(), "cannot complete with a dgram missing");

        // tick past the initial backoff; only the lost dgram is retransmitted
        pair.client.time_pass(100);
        pair.pump_filtered(100, &mut filter);

        assert_eq!(dgram_3_transmissions, 2);
        assert_eq!(seen.lock().unwrap().as_deref(), Some(&msg[..]));

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].result.is_ok());
        assert_eq!(pair.client.num_used_slots(), 0);
        assert_eq!(pair.server.num_used_slots(), 0);
    }

    #[rstest]
    fn test_ack_window_bounds_in_flight_dgrams() {
        let mut pair = TestPair::new();

        let msg = vec![0u8; 32 * 1024]; // 23 dgrams
        let (callback, _completions) = capture();
        pair.send_request(
            Bytes::from(msg), 5, 3, callback,
            Some(Duration::from_secs(60)), Niceness::Low, None, 0,
        );

        // nothing comes back, so the window fills and sending stops
        pair.pump_filtered(0, &mut |_, _| true);

        let statistics = pair.client.get_statistics(0);
        assert_eq!(statistics.len(), 1);
        assert_eq!(statistics[0].send_dgram_count, 23);
        assert_eq!(statistics[0].sent_dgrams, 16);
        assert_eq!(statistics[0].acked_dgrams, 0);
    }

    #[rstest]
    fn test_timeout_fires_with_dgrams_in_flight() {
        let mut pair = TestPair::new();

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from_static(b"into the void"), 3, 4, callback,
            Some(Duration::from_millis(500)), Niceness::Low, None, 0,
        );
        pair.pump_filtered(0, &mut |_, _| true);

        // ticks before the deadline only drive resends
        pair.client.time_pass(400);
        pair.client.callback_pass(400);
        assert!(completions.lock().unwrap().is_empty());

        pair.client.time_pass(501);
        pair.client.callback_pass(501);

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, Err(ErrorCode::Timeout));
        assert_eq!(pair.client.num_used_slots(), 0);
    }

    #[rstest]
    fn test_no_ack_fast_fail_with_constant_backoff() {
        let mut pair = TestPair::new();

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from_static(b"fail fast"), 3, 5, callback,
            Some(Duration::from_secs(30)), Niceness::High, Some(3), 0,
        );
        pair.pump_filtered(0, &mut |_, _| true);

        // high priority backoff stays at 30ms, so the deadlines land at
        // 30/60/90/120ms and the fourth one exceeds max_resends=3 - well
        // within the exponential bound of 30 * (2^3 - 1) = 210ms
        let mut failed_at = None;
        for t in [30u64, 60, 90, 120] {
            pair.client.time_pass(t);
            pair.pump_filtered(t, &mut |_, _| true);
            if !completions.lock().unwrap().is_empty() {
                failed_at = Some(t);
                break;
            }
        }

        assert_eq!(failed_at, Some(120));
        let completions = completions.lock().unwrap();
        assert_eq!(completions[0].result, Err(ErrorCode::NoAck));
        assert_eq!(pair.client.num_used_slots(), 0);
    }

    #[rstest]
    fn test_low_priority_backoff_doubles() {
        let mut pair = TestPair::new();

        let (callback, _completions) = capture();
        pair.send_request(
            Bytes::from_static(b"slowly now"), 3, 6, callback,
            None, Niceness::Low, None, 0,
        );

        let transmissions = std::cell::Cell::new(0);
        let mut count_and_drop = |_: bool, _: &[u8]| {
            transmissions.set(transmissions.get() + 1);
            true
        };
        pair.pump_filtered(0, &mut count_and_drop);
        assert_eq!(transmissions.get(), 1);

        // initial backoff 100ms doubling to 200: resends due at 100 and 300
        for t in [50u64, 100, 150, 200, 250, 300] {
            pair.client.time_pass(t);
            pair.pump_filtered(t, &mut count_and_drop);
        }
        assert_eq!(transmissions.get(), 3);

        let statistics = pair.client.get_statistics(300);
        assert_eq!(statistics[0].resend_count, 2);
    }

    #[rstest]
    fn test_cancellation_and_late_reply() {
        let mut pair = TestPair::new();

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from_static(b"never mind"), 9, 77, callback,
            None, Niceness::Low, None, 0,
        );

        let proto = MattsterProtocol;
        let mut trans_id = 0;
        pair.pump_filtered(0, &mut |from_client, dgram| {
            if from_client {
                trans_id = proto.parse(dgram).unwrap().trans_id;
            }
            true // black hole
        });
        assert_ne!(trans_id, 0);

        pair.client.cancel_unlocked(77, 9, 10);
        pair.client.callback_pass(10);

        {
            let completions = completions.lock().unwrap();
            assert_eq!(completions.len(), 1);
            assert_eq!(completions[0].result, Err(ErrorCode::Cancelled));
        }
        assert_eq!(pair.client.num_used_slots(), 0);

        // the peer notification went out as a slot-less cancel dgram
        let plan = pair.client.pick_best_send(10).unwrap();
        let (dgram, _) = pair.client.build_dgram(&plan);
        pair.client.commit_send(&plan, dgram.len(), 10);
        assert!(proto.parse(&dgram).unwrap().is_cancel());

        // a straggling reply for the cancelled transaction is dropped
        let mut late_reply = BytesMut::new();
        proto.emit_data(trans_id, 9, Niceness::Low, false, 0, 1, b"too late", &mut late_reply);
        pair.client.handle_dgram(&late_reply, pair.server_addr, 20);
        pair.client.callback_pass(20);

        assert_eq!(completions.lock().unwrap().len(), 1);
        assert_eq!(pair.client.num_used_slots(), 0);
        assert_eq!(pair.client_stats.num_dropped_dgrams(), 1);
    }

    #[rstest]
    fn test_peer_cancel_drops_incoming_slot() {
        let mut pair = TestPair::new();

        // no handler registered on purpose: the request parks in the waiting
        // state until the peer gives up
        let proto = MattsterProtocol;
        let mut request = BytesMut::new();
        proto.emit_data(55, 9, Niceness::Low, true, 0, 1, b"forget me", &mut request);
        pair.server.handle_dgram(&request, pair.client_addr, 0);
        assert_eq!(pair.server.num_used_slots_incoming(), 1);

        let mut cancel = BytesMut::new();
        proto.emit_cancel(55, 9, &mut cancel);
        pair.server.handle_dgram(&cancel, pair.client_addr, 1);
        pair.server.callback_pass(1);

        assert_eq!(pair.server.num_used_slots_incoming(), 0);
        assert_eq!(pair.server.requests_in_waiting(9), 0);
    }

    #[rstest]
    fn test_handler_absent_propagates_error() {
        let mut pair = TestPair::new();

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from_static(b"nobody home"), 42, 8, callback,
            Some(Duration::from_secs(60)), Niceness::Low, None, 0,
        );
        pair.pump(0);

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, Err(ErrorCode::HandlerAbsent));
        assert_eq!(pair.server.num_used_slots(), 0);
        assert_eq!(pair.client.num_used_slots(), 0);
    }

    #[rstest]
    fn test_outgoing_fails_when_table_full() {
        let (mut core, _stats) = new_core(Arc::new(MattsterProtocol), 2);
        let peer = SocketAddr::from_str("127.0.0.2:2222").unwrap();

        for token in 0..2 {
            let (callback, _) = capture();
            core.send_request_unlocked(
                Bytes::from_static(b"x"), 1, peer, None, token, callback,
                None, Niceness::Low, None, 0,
            )
            .unwrap();
        }

        let (callback, _) = capture();
        let result = core.send_request_unlocked(
            Bytes::from_static(b"x"), 1, peer, None, 9, callback,
            None, Niceness::Low, None, 0,
        );
        assert!(result.is_err());
        assert_eq!(core.num_used_slots(), 2);
    }

    #[rstest]
    fn test_incoming_beyond_capacity_dropped_silently() {
        let (mut core, stats) = new_core(Arc::new(MattsterProtocol), 1);
        let peer = SocketAddr::from_str("127.0.0.9:9999").unwrap();

        let proto = MattsterProtocol;
        for trans_id in [70, 71] {
            let mut dgram = BytesMut::new();
            proto.emit_data(trans_id, 2, Niceness::Low, true, 0, 1, b"hi", &mut dgram);
            core.handle_dgram(&dgram, peer, 0);
        }

        assert_eq!(core.num_used_slots(), 1);
        assert_eq!(stats.num_dropped_dgrams(), 1);
    }

    #[rstest]
    fn test_duplicate_dgram_is_idempotent() {
        let (mut core, _stats) = new_core(Arc::new(MattsterProtocol), 8);
        let peer = SocketAddr::from_str("127.0.0.9:9999").unwrap();

        let invocations = Arc::new(Mutex::new(0u32));
        let counter = invocations.clone();
        core.register_handler(2, Arc::new(move |ctx: &mut TransportCtx<'_>, request: Request| {
            *counter.lock().unwrap() += 1;
            ctx.send_reply(Bytes::from_static(b"ok"), request.slot, None);
        }))
        .unwrap();

        let proto = MattsterProtocol;
        let mut dgram = BytesMut::new();
        proto.emit_data(70, 2, Niceness::Low, true, 0, 1, b"hi", &mut dgram);

        core.handle_dgram(&dgram, peer, 0);
        assert_eq!(core.requests_in_waiting(2), 1);
        core.handle_dgram(&dgram, peer, 0);
        assert_eq!(core.requests_in_waiting(2), 1);
        assert_eq!(core.num_used_slots(), 1);

        core.callback_pass(0);
        assert_eq!(*invocations.lock().unwrap(), 1);
        assert_eq!(core.requests_in_waiting(2), 0);

        // the duplicate left a pending re-ACK
        let plan = core.pick_best_send(0).unwrap();
        let (ack, _) = core.build_dgram(&plan);
        assert!(proto.parse(&ack).unwrap().is_ack());
    }

    #[rstest]
    fn test_graceful_shutdown_rejects_new_requests() {
        let mut pair = TestPair::new();
        register_echo(&mut pair, 7);

        pair.server.shutdown_unlocked(false, 0);

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from_static(b"one more"), 7, 11, callback,
            Some(Duration::from_secs(60)), Niceness::Low, None, 0,
        );
        pair.pump(0);

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, Err(ErrorCode::Closed));
        assert!(pair.server.shutdown_complete());
    }

    #[rstest]
    fn test_urgent_shutdown_fails_all_active() {
        let mut pair = TestPair::new();

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from_static(b"in flight"), 7, 12, callback,
            None, Niceness::Low, None, 0,
        );
        pair.pump_filtered(0, &mut |_, _| true);

        pair.client.shutdown_unlocked(true, 5);
        pair.client.callback_pass(5);

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result, Err(ErrorCode::Shutdown));
        assert!(pair.client.shutdown_complete());
    }

    #[rstest]
    fn test_replace_host_rekeys_active_slots() {
        let (mut core, _stats) = new_core(Arc::new(MattsterProtocol), 8);
        let old_addr = SocketAddr::from_str("10.0.0.1:7000").unwrap();
        let new_addr = SocketAddr::from_str("10.0.0.2:7000").unwrap();

        let (callback, _) = capture();
        core.send_request_unlocked(
            Bytes::from_static(b"moving target"), 6, old_addr, Some(5), 13, callback,
            None, Niceness::Low, None, 0,
        )
        .unwrap();
        while let Some(plan) = core.pick_best_send(0) {
            let (dgram, _) = core.build_dgram(&plan);
            core.commit_send(&plan, dgram.len(), 0);
        }

        core.replace_host_unlocked(
            &Host { host_id: 5, addr: old_addr },
            &Host { host_id: 6, addr: new_addr },
        );

        let statistics = core.get_statistics(0);
        assert_eq!(statistics[0].peer, new_addr);

        // an ACK arriving from the new address resolves the re-keyed slot
        let proto = MattsterProtocol;
        let mut ack = BytesMut::new();
        proto.emit_ack(statistics[0].trans_id, 6, true, 0, 1, &mut ack);
        core.handle_dgram(&ack, new_addr, 1);

        assert_eq!(core.get_statistics(1)[0].acked_dgrams, 1);
    }

    #[rstest]
    fn test_transaction_ids_are_monotonic() {
        let (mut core, _stats) = new_core(Arc::new(MattsterProtocol), 8);
        let peer = SocketAddr::from_str("127.0.0.2:2222").unwrap();

        for token in 0..3 {
            let (callback, _) = capture();
            core.send_request_unlocked(
                Bytes::from_static(b"x"), 1, peer, None, token, callback,
                None, Niceness::Low, None, 0,
            )
            .unwrap();
        }

        let mut ids: Vec<u32> = core.get_statistics(0).iter().map(|s| s.trans_id).collect();
        let sorted = {
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            sorted
        };
        assert_eq!(ids.len(), 3);
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids, sorted);
    }

    #[rstest]
    fn test_dns_round_trip_without_acks() {
        let mut pair = TestPair::with_protocol(Arc::new(DnsProtocol));
        let seen = register_echo(&mut pair, 0);

        // QDCOUNT=1 and a question section, as a resolver would send
        let mut question = vec![0u8, 1, 0, 0, 0, 0, 0, 0];
        question.extend_from_slice(b"\x03gb\x00\x00\x01\x00\x01");

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from(question.clone()), 0, 14, callback,
            Some(Duration::from_secs(5)), Niceness::High, None, 0,
        );

        let mut wire_dgrams = 0;
        pair.pump_filtered(0, &mut |_, _| {
            wire_dgrams += 1;
            false
        });

        // one query, one response, no acknowledgments
        assert_eq!(wire_dgrams, 2);
        assert_eq!(seen.lock().unwrap().as_deref(), Some(&question[..]));

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result.as_ref().unwrap(), &Bytes::from(question));
        assert_eq!(pair.client.num_used_slots(), 0);
        assert_eq!(pair.server.num_used_slots(), 0);
    }

    #[rstest]
    fn test_reply_to_dead_slot_is_acked_slotlessly() {
        let (mut core, stats) = new_core(Arc::new(MattsterProtocol), 8);
        let peer = SocketAddr::from_str("127.0.0.9:9999").unwrap();

        let proto = MattsterProtocol;
        let mut reply = BytesMut::new();
        proto.emit_data(123, 3, Niceness::Low, false, 0, 1, b"orphan", &mut reply);
        core.handle_dgram(&reply, peer, 0);

        assert_eq!(core.num_used_slots(), 0);
        assert_eq!(stats.num_dropped_dgrams(), 1);

        let plan = core.pick_best_send(0).unwrap();
        let (dgram, to) = core.build_dgram(&plan);
        core.commit_send(&plan, dgram.len(), 0);
        assert_eq!(to, peer);
        let header = proto.parse(&dgram).unwrap();
        assert!(header.is_ack());
        assert_eq!(header.trans_id, 123);
    }

    #[rstest]
    fn test_deferred_reply_through_retained_slot_ref() {
        let mut pair = TestPair::new();

        // the handler only parks the slot handle; the reply comes later, the
        // way a handler that spawns real work would do it
        let parked = Arc::new(Mutex::new(None));
        let parked_in_handler = parked.clone();
        pair.server
            .register_handler(4, Arc::new(move |_ctx: &mut TransportCtx<'_>, request: Request| {
                *parked_in_handler.lock().unwrap() = Some(request.slot);
            }))
            .unwrap();

        let (callback, completions) = capture();
        pair.send_request(
            Bytes::from_static(b"take your time"), 4, 15, callback,
            Some(Duration::from_secs(60)), Niceness::Low, None, 0,
        );
        pair.pump(0);

        assert!(completions.lock().unwrap().is_empty());
        assert_eq!(pair.server.requests_in_waiting(4), 1);

        let slot_ref = parked.lock().unwrap().take().unwrap();
        pair.server.send_reply_unlocked(Bytes::from_static(b"done now"), slot_ref, None, 50);
        pair.pump(50);

        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result.as_ref().unwrap(), &Bytes::from_static(b"done now"));
        assert_eq!(pair.server.requests_in_waiting(4), 0);

        // the handle is stale once the slot completed
        pair.server.send_reply_unlocked(Bytes::from_static(b"again?"), slot_ref, None, 60);
        assert_eq!(pair.server.num_used_slots(), 0);
    }
}
