use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::ensure;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

pub(crate) mod core;
pub mod handler;
pub mod slot;
pub(crate) mod slot_table;
pub mod stats;

pub use handler::{Completion, ErrorCode, ReplyCallback, ReplyDoneCallback, Request, RequestHandler, TransportCtx};
pub use slot::{Millis, SlotRef};
pub use stats::{ServerStats, SlotStatistic};

use crate::protocol::{DgramProtocol, MsgType, Niceness};
use crate::server::core::TransportCore;

/// A host entry for address remapping: slots can be bound to a host id, and
/// [UdpServer::replace_host] rewrites their endpoint when the host moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Host {
    pub host_id: i32,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Requested OS receive buffer size, recorded for diagnostics.
    pub read_buf_size: usize,
    /// Requested OS send buffer size, recorded for diagnostics.
    pub write_buf_size: usize,
    /// Tick interval driving timeouts and retransmission. Must not exceed the
    /// smallest per-slot timeout, otherwise deadlines are missed by up to a
    /// full tick.
    pub poll_time: Duration,
    /// Slot pool capacity; bounds concurrent in-flight transactions.
    pub max_slots: usize,
    /// Whether the protocol is the DNS variant; cross-checked against the
    /// protocol's capabilities at init.
    pub is_dns: bool,
    /// Peers with these addresses are counted as eth0/eth1 traffic, everything
    /// else as outsider.
    pub primary_ip: Option<IpAddr>,
    pub secondary_ip: Option<IpAddr>,
    /// First resend wait for low priority slots; doubles per miss.
    pub initial_backoff: Duration,
    /// Constant resend wait for high priority slots, kept small so a caller
    /// can fail over to another host quickly.
    pub high_priority_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for incoming slots (request reception plus reply delivery).
    pub incoming_timeout: Duration,
    /// Maximum unacknowledged sent dgrams per slot.
    pub ack_window: u32,
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            read_buf_size: 256 * 1024,
            write_buf_size: 256 * 1024,
            poll_time: Duration::from_millis(30),
            max_slots: 2048,
            is_dns: false,
            primary_ip: None,
            secondary_ip: None,
            initial_backoff: Duration::from_millis(100),
            high_priority_backoff: Duration::from_millis(30),
            max_backoff: Duration::from_secs(2),
            incoming_timeout: Duration::from_secs(60),
            ack_window: 16,
        }
    }
}

/// The reliable UDP request/reply server.
///
/// One UDP socket serves all transactions. The transport state machine lives
/// behind a single mutex and is driven by [UdpServer::run], which multiplexes
/// socket readability, socket writability (armed on demand) and a periodic
/// tick; the mutex is never held across an await, and all socket I/O is
/// non-blocking.
///
/// Public entry points lock the mutex; handlers and callbacks, which already
/// run under it, use the [TransportCtx] they are given instead.
pub struct UdpServer {
    socket: UdpSocket,
    core: Mutex<TransportCore>,
    stats: Arc<ServerStats>,
    proto: Arc<dyn DgramProtocol>,
    notify_send: Notify,
    epoch: Instant,
    local_addr: SocketAddr,
    poll_time: Duration,
    read_buf_size: usize,
}

impl UdpServer {
    /// Binds the UDP socket and assembles the transport. Port 0 binds an
    /// ephemeral port; see [UdpServer::local_addr].
    pub async fn init(
        port: u16,
        proto: Arc<dyn DgramProtocol>,
        config: ServerConfig,
    ) -> anyhow::Result<Arc<UdpServer>> {
        ensure!(config.max_slots > 0, "max_slots must be positive");
        ensure!(!config.poll_time.is_zero(), "poll_time must be positive");
        ensure!(
            config.poll_time <= config.incoming_timeout,
            "poll_time exceeds the minimum slot timeout"
        );
        ensure!(
            config.is_dns == !proto.uses_acks(),
            "is_dns does not match the {} protocol", proto.name()
        );

        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let local_addr = socket.local_addr()?;
        let stats = Arc::new(ServerStats::new(config.primary_ip, config.secondary_ip));

        info!(%local_addr, protocol = proto.name(), max_slots = config.max_slots, "transport listening");

        Ok(Arc::new(UdpServer {
            core: Mutex::new(TransportCore::new(proto.clone(), &config, stats.clone())),
            socket,
            stats,
            proto,
            notify_send: Notify::new(),
            epoch: Instant::now(),
            local_addr,
            poll_time: config.poll_time,
            read_buf_size: config.read_buf_size,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    fn now_ms(&self) -> Millis {
        self.epoch.elapsed().as_millis() as Millis
    }

    fn core(&self) -> MutexGuard<'_, TransportCore> {
        self.core.lock().expect("transport mutex poisoned")
    }

    /// Drives the transport until shutdown completes. Run this on its own
    /// task; everything else is callable from anywhere.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut tick = time::interval(self.poll_time);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut read_buf = vec![0u8; self.read_buf_size.max(64 * 1024)];

        loop {
            let (need_send, done) = {
                let core = self.core();
                (core.need_send, core.shutdown_complete())
            };
            if done {
                break;
            }

            tokio::select! {
                result = self.socket.readable() => {
                    result?;
                    self.process(true, false, &mut read_buf);
                }
                result = self.socket.writable(), if need_send => {
                    result?;
                    self.process(false, false, &mut read_buf);
                }
                _ = self.notify_send.notified() => {
                    self.process(false, false, &mut read_buf);
                }
                _ = tick.tick() => {
                    self.process(false, true, &mut read_buf);
                }
            }
        }

        info!(local_addr = %self.local_addr, "transport shut down");
        Ok(())
    }

    /// One scheduling pass: read everything pending, run the tick if due,
    /// send until the socket blocks or nothing is left, then deliver
    /// callbacks - in that order, so acknowledgments for completed
    /// transactions reach the wire before their slots are torn down.
    fn process(&self, read: bool, tick: bool, read_buf: &mut [u8]) {
        let now = self.now_ms();
        let mut core = self.core();

        if read {
            loop {
                match self.socket.try_recv_from(read_buf) {
                    Ok((len, from)) => {
                        self.stats.record_in(from.ip(), len);
                        core.handle_dgram(&read_buf[..len], from, now);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("socket read error: {}", e);
                        break;
                    }
                }
            }
        }

        if tick {
            core.time_pass(now);
        }

        loop {
            let mut blocked = false;
            core.need_send = false;
            while let Some(plan) = core.pick_best_send(now) {
                let (dgram, to) = core.build_dgram(&plan);
                match self.socket.try_send_to(&dgram, to) {
                    Ok(sent) => {
                        self.stats.record_out(to.ip(), sent);
                        core.commit_send(&plan, sent, now);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        core.need_send = true;
                        blocked = true;
                        break;
                    }
                    Err(e) => {
                        // a hard send error (e.g. a port unreachable surfaced
                        // by the OS) is treated like a lost dgram: commit and
                        // let retransmission or the deadline settle it
                        warn!(%to, "sendto failed: {}", e);
                        core.commit_send(&plan, dgram.len(), now);
                    }
                }
            }

            core.callback_pass(now);

            // callbacks may have armed new sends; flush them unless the
            // socket already pushed back
            if blocked || !core.need_send {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // public API - locking twins of the core's _unlocked entry points
    // ------------------------------------------------------------------

    pub fn register_handler(&self, msg_type: MsgType, handler: RequestHandler) -> anyhow::Result<()> {
        self.core().register_handler(msg_type, handler)
    }

    pub fn has_handler(&self, msg_type: MsgType) -> bool {
        self.core().has_handler(msg_type)
    }

    /// Dispatches a typed request to a destination. The callback fires exactly
    /// once with the reply bytes or an error code; the returned handle can be
    /// used for cancellation book-keeping but is not required.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        &self,
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
        let now = self.now_ms();
        let result = self.core().send_request_unlocked(
            msg, msg_type, peer, host_id, token, callback, timeout, niceness, max_resends, now,
        );
        self.notify_send.notify_one();
        result
    }

    /// Answers an incoming request. Valid once per slot; the slot lives until
    /// the reply's last dgram is acknowledged.
    pub fn send_reply(&self, msg: Bytes, slot: SlotRef, done: Option<ReplyDoneCallback>) {
        let now = self.now_ms();
        self.core().send_reply_unlocked(msg, slot, done, now);
        self.notify_send.notify_one();
    }

    pub fn send_error_reply(&self, slot: SlotRef, code: ErrorCode) {
        let now = self.now_ms();
        self.core().send_error_reply_unlocked(slot, code, now);
        self.notify_send.notify_one();
    }

    /// Fails every outgoing transaction matching `(token, msg_type)` with a
    /// cancellation error; the callbacks fire from this call.
    pub fn cancel(&self, token: u64, msg_type: MsgType) {
        let now = self.now_ms();
        {
            let mut core = self.core();
            core.cancel_unlocked(token, msg_type, now);
            core.callback_pass(now);
        }
        self.notify_send.notify_one();
    }

    pub fn replace_host(&self, old: &Host, new: &Host) {
        self.core().replace_host_unlocked(old, new);
    }

    /// Urgent shutdown fails all in-flight transactions and returns once
    /// their callbacks ran; graceful shutdown stops accepting new incoming
    /// requests and lets [UdpServer::run] exit when the last slot completes
    /// or times out.
    pub fn shutdown(&self, urgent: bool) {
        let now = self.now_ms();
        {
            let mut core = self.core();
            core.shutdown_unlocked(urgent, now);
            if urgent {
                core.callback_pass(now);
            }
        }
        self.notify_send.notify_one();
    }

    pub fn num_used_slots(&self) -> usize {
        self.core().num_used_slots()
    }

    pub fn num_used_slots_incoming(&self) -> usize {
        self.core().num_used_slots_incoming()
    }

    /// Requests fully received but not yet answered, for one message type.
    pub fn requests_in_waiting(&self, msg_type: MsgType) -> u32 {
        self.core().requests_in_waiting(msg_type)
    }

    pub fn num_dropped_dgrams(&self) -> i64 {
        self.stats.num_dropped_dgrams()
    }

    /// Point-in-time summaries of all active slots.
    pub fn get_statistics(&self) -> Vec<SlotStatistic> {
        self.core().get_statistics(self.now_ms())
    }

    /// Writes the versioned active-slot snapshot, optionally filtered by
    /// message type. Meant for diagnostics on shutdown.
    pub fn save_active_slots(&self, out: &mut dyn Write, msg_type: Option<MsgType>) -> anyhow::Result<()> {
        self.core().save_active_slots(out, msg_type, self.now_ms())
    }

    pub fn protocol(&self) -> &Arc<dyn DgramProtocol> {
        &self.proto
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout as tokio_timeout};

    use crate::protocol::MattsterProtocol;

    use super::*;

    async fn start_server(mut config: ServerConfig) -> (Arc<UdpServer>, JoinHandle<anyhow::Result<()>>) {
        config.poll_time = Duration::from_millis(10);
        let server = UdpServer::init(0, Arc::new(MattsterProtocol), config)
            .await
            .unwrap();
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        (server, runner)
    }

    fn loopback(server: &UdpServer) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
    }

    fn completion_channel() -> (ReplyCallback, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let callback: ReplyCallback = Box::new(move |_ctx, completion| {
            let _ = tx.send(completion);
        });
        (callback, rx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_round_trip() {
        let (client, _client_task) = start_server(ServerConfig::new()).await;
        let (server, _server_task) = start_server(ServerConfig::new()).await;

        server
            .register_handler(7, Arc::new(|ctx: &mut TransportCtx<'_>, request: Request| {
                let mut reply = request.payload.to_vec();
                reply.reverse();
                ctx.send_reply(Bytes::from(reply), request.slot, None);
            }))
            .unwrap();

        let (callback, rx) = completion_channel();
        client
            .send_request(
                Bytes::from_static(b"hello transport"),
                7,
                loopback(&server),
                None,
                1,
                callback,
                Some(Duration::from_secs(5)),
                Niceness::Low,
                None,
            )
            .unwrap();

        let completion = tokio_timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(completion.token, 1);
        assert_eq!(completion.msg_type, 7);
        let reply = completion.result.unwrap();
        assert_eq!(&reply[..], b"tropsnart olleh");

        // both sides settle back to an empty table
        sleep(Duration::from_millis(200)).await;
        assert_eq!(client.num_used_slots(), 0);
        assert_eq!(server.num_used_slots(), 0);
        assert_eq!(server.num_used_slots_incoming(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_large_request_reassembles() {
        let (client, _client_task) = start_server(ServerConfig::new()).await;
        let (server, _server_task) = start_server(ServerConfig::new()).await;

        let received = Arc::new(StdMutex::new(None));
        let received_in_handler = received.clone();
        server
            .register_handler(12, Arc::new(move |ctx: &mut TransportCtx<'_>, request: Request| {
                *received_in_handler.lock().unwrap() = Some(request.payload.clone());
                ctx.send_reply(Bytes::from_static(b"got it"), request.slot, None);
            }))
            .unwrap();

        let msg: Vec<u8> = (0..32 * 1024).map(|i| (i % 251) as u8).collect();
        let (callback, rx) = completion_channel();
        client
            .send_request(
                Bytes::from(msg.clone()),
                12,
                loopback(&server),
                None,
                2,
                callback,
                Some(Duration::from_secs(10)),
                Niceness::Low,
                None,
            )
            .unwrap();

        let completion = tokio_timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();
        assert_eq!(completion.result.unwrap(), Bytes::from_static(b"got it"));
        assert_eq!(received.lock().unwrap().as_deref(), Some(&msg[..]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_against_black_hole() {
        let (client, _client_task) = start_server(ServerConfig::new()).await;

        // bind a socket to reserve a port nothing will ever answer from, and
        // keep it alive so the port stays black-holed
        let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = black_hole.local_addr().unwrap();

        let (callback, rx) = completion_channel();
        client
            .send_request(
                Bytes::from_static(b"anyone there?"),
                3,
                peer,
                None,
                3,
                callback,
                Some(Duration::from_millis(500)),
                Niceness::Low,
                None,
            )
            .unwrap();

        let completion = tokio_timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(completion.result.unwrap_err(), ErrorCode::Timeout);
        assert_eq!(client.num_used_slots(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_ack_fast_fail() {
        let (client, _client_task) = start_server(ServerConfig::new()).await;

        let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = black_hole.local_addr().unwrap();

        let started = Instant::now();
        let (callback, rx) = completion_channel();
        client
            .send_request(
                Bytes::from_static(b"fail fast"),
                3,
                peer,
                None,
                4,
                callback,
                Some(Duration::from_secs(30)),
                Niceness::High,
                Some(3),
            )
            .unwrap();

        let completion = tokio_timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(completion.result.unwrap_err(), ErrorCode::NoAck);
        // constant 30ms high priority backoff: 4 deadlines, well under the
        // exponential bound of about 210ms plus scheduling slack
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handler_absent_error_reply() {
        let (client, _client_task) = start_server(ServerConfig::new()).await;
        let (server, _server_task) = start_server(ServerConfig::new()).await;

        let (callback, rx) = completion_channel();
        client
            .send_request(
                Bytes::from_static(b"nobody home"),
                42,
                loopback(&server),
                None,
                5,
                callback,
                Some(Duration::from_secs(5)),
                Niceness::Low,
                None,
            )
            .unwrap();

        let completion = tokio_timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(completion.result.unwrap_err(), ErrorCode::HandlerAbsent);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation() {
        let (client, _client_task) = start_server(ServerConfig::new()).await;

        let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = black_hole.local_addr().unwrap();

        let (callback, rx) = completion_channel();
        client
            .send_request(
                Bytes::from_static(b"going nowhere"),
                9,
                peer,
                None,
                77,
                callback,
                None,
                Niceness::Low,
                None,
            )
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        client.cancel(77, 9);

        let completion = tokio_timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(completion.result.unwrap_err(), ErrorCode::Cancelled);
        assert_eq!(client.num_used_slots(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_graceful_shutdown_finishes_run() {
        let (server, runner) = start_server(ServerConfig::new()).await;

        server.shutdown(false);

        let result = tokio_timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_urgent_shutdown_fails_in_flight() {
        let (client, runner) = start_server(ServerConfig::new()).await;

        let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = black_hole.local_addr().unwrap();

        let (callback, rx) = completion_channel();
        client
            .send_request(
                Bytes::from_static(b"doomed"),
                1,
                peer,
                None,
                6,
                callback,
                None,
                Niceness::Low,
                None,
            )
            .unwrap();

        client.shutdown(true);

        let completion = tokio_timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(completion.result.unwrap_err(), ErrorCode::Shutdown);

        let result = tokio_timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();
        assert!(result.is_ok());

        // further requests are refused
        let (callback, _rx) = completion_channel();
        assert!(client
            .send_request(
                Bytes::from_static(b"too late"),
                1,
                peer,
                None,
                7,
                callback,
                None,
                Niceness::Low,
                None,
            )
            .is_err());
    }
}
