use std::io::Write;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::protocol::{MsgType, Niceness};
use crate::server::slot::Millis;

/// Byte and packet counters for one interface class. Updated with relaxed
/// atomics outside the transport mutex.
#[derive(Debug, Default)]
pub struct IfaceCounters {
    pub bytes_in: AtomicI64,
    pub bytes_out: AtomicI64,
    pub packets_in: AtomicI64,
    pub packets_out: AtomicI64,
}

/// Traffic counters kept per interface class: the primary and secondary
/// internal addresses and everything else ("outsider"), mirroring a two-NIC
/// cluster host talking to the outside world.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub eth0: IfaceCounters,
    pub eth1: IfaceCounters,
    pub outsider: IfaceCounters,
    pub dropped_dgrams: AtomicI64,
    pub used_slots_incoming: AtomicI64,

    primary_ip: Option<IpAddr>,
    secondary_ip: Option<IpAddr>,
}

impl ServerStats {
    pub fn new(primary_ip: Option<IpAddr>, secondary_ip: Option<IpAddr>) -> ServerStats {
        ServerStats {
            primary_ip,
            secondary_ip,
            ..Default::default()
        }
    }

    fn iface(&self, peer: IpAddr) -> &IfaceCounters {
        if self.primary_ip == Some(peer) {
            &self.eth0
        } else if self.secondary_ip == Some(peer) {
            &self.eth1
        } else {
            &self.outsider
        }
    }

    pub fn record_in(&self, peer: IpAddr, bytes: usize) {
        let iface = self.iface(peer);
        iface.bytes_in.fetch_add(bytes as i64, Ordering::Relaxed);
        iface.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self, peer: IpAddr, bytes: usize) {
        let iface = self.iface(peer);
        iface.bytes_out.fetch_add(bytes as i64, Ordering::Relaxed);
        iface.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_dgrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn num_dropped_dgrams(&self) -> i64 {
        self.dropped_dgrams.load(Ordering::Relaxed)
    }
}

/// Point-in-time summary of one active slot, for introspection and the
/// shutdown snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatistic {
    pub trans_id: u32,
    pub peer: SocketAddr,
    pub msg_type: MsgType,
    pub incoming: bool,
    pub niceness: Niceness,
    pub age_ms: Millis,
    pub send_dgram_count: u32,
    pub recv_dgram_count: u32,
    pub sent_dgrams: u32,
    pub acked_dgrams: u32,
    pub received_dgrams: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub resend_count: u32,
}

const SNAPSHOT_MAGIC: &[u8; 7] = b"UDPSNAP";
const SNAPSHOT_VERSION: u8 = 1;

const FLAG_INCOMING: u8 = 0x01;
const FLAG_NICENESS_LOW: u8 = 0x02;

/// Writes the active-slot snapshot taken on shutdown: magic and version, a
/// record count, then one fixed-order record per slot. The version byte is
/// the escape hatch for evolving the record layout.
pub fn write_snapshot(out: &mut dyn Write, slots: &[SlotStatistic]) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    buf.put_slice(SNAPSHOT_MAGIC);
    buf.put_u8(SNAPSHOT_VERSION);
    buf.put_u32(slots.len() as u32);

    for slot in slots {
        buf.put_u32(slot.trans_id);
        match slot.peer {
            SocketAddr::V4(addr) => {
                buf.put_u8(4);
                buf.put_u32(addr.ip().to_bits());
            }
            SocketAddr::V6(addr) => {
                buf.put_u8(6);
                buf.put_u128(addr.ip().to_bits());
            }
        }
        buf.put_u16(slot.peer.port());
        buf.put_u8(slot.msg_type);
        let mut flags = 0u8;
        if slot.incoming {
            flags |= FLAG_INCOMING;
        }
        if slot.niceness == Niceness::Low {
            flags |= FLAG_NICENESS_LOW;
        }
        buf.put_u8(flags);
        buf.put_u64(slot.age_ms);
        buf.put_u16(slot.send_dgram_count as u16);
        buf.put_u16(slot.recv_dgram_count as u16);
        buf.put_u16(slot.sent_dgrams as u16);
        buf.put_u16(slot.acked_dgrams as u16);
        buf.put_u16(slot.received_dgrams as u16);
        buf.put_u32(slot.resend_count);
        buf.put_u64(slot.bytes_sent);
        buf.put_u64(slot.bytes_received);
    }

    out.write_all(&buf)?;
    Ok(())
}

/// Parses a snapshot back into slot summaries, for diagnostics tooling.
pub fn parse_snapshot(data: &[u8]) -> anyhow::Result<Vec<SlotStatistic>> {
    let buf = &mut &data[..];

    let mut magic = [0u8; 7];
    for byte in &mut magic {
        *byte = buf.try_get_u8()?;
    }
    if &magic != SNAPSHOT_MAGIC {
        bail!("not a slot snapshot");
    }
    let version = buf.try_get_u8()?;
    if version != SNAPSHOT_VERSION {
        bail!("unsupported snapshot version {}", version);
    }

    let count = buf.try_get_u32()?;
    let mut slots = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let trans_id = buf.try_get_u32()?;
        let ip = match buf.try_get_u8()? {
            4 => IpAddr::V4(buf.try_get_u32()?.into()),
            6 => IpAddr::V6(buf.try_get_u128()?.into()),
            n => return Err(anyhow!("invalid address discriminator {}", n)),
        };
        let port = buf.try_get_u16()?;
        let peer = match ip {
            IpAddr::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip, port)),
            IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
        };
        let msg_type = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;
        let age_ms = buf.try_get_u64()?;
        let send_dgram_count = buf.try_get_u16()? as u32;
        let recv_dgram_count = buf.try_get_u16()? as u32;
        let sent_dgrams = buf.try_get_u16()? as u32;
        let acked_dgrams = buf.try_get_u16()? as u32;
        let received_dgrams = buf.try_get_u16()? as u32;
        let resend_count = buf.try_get_u32()?;
        let bytes_sent = buf.try_get_u64()?;
        let bytes_received = buf.try_get_u64()?;

        slots.push(SlotStatistic {
            trans_id,
            peer,
            msg_type,
            incoming: flags & FLAG_INCOMING != 0,
            niceness: if flags & FLAG_NICENESS_LOW != 0 { Niceness::Low } else { Niceness::High },
            age_ms,
            send_dgram_count,
            recv_dgram_count,
            sent_dgrams,
            acked_dgrams,
            received_dgrams,
            bytes_sent,
            bytes_received,
            resend_count,
        });
    }
    Ok(slots)
}
