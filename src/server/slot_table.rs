use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use rustc_hash::FxHasher;

use crate::server::slot::{Millis, SlotKey, SlotRef, UdpSlot};

/// Fixed-capacity pool of slots with key lookup and the three intrusive lists.
///
/// All slots are allocated up front in one arena; vacant slots are threaded
/// onto a singly linked free list, used slots onto a doubly linked active list
/// (FIFO order, which the send fairness relies on for tie-breaking), and slots
/// with a pending callback additionally onto the callback list. List hooks are
/// arena indices stored in the slots themselves, so moving a slot between
/// states never allocates.
///
/// Keys are resolved through an open-addressed hash of arena indices with
/// linear probing, sized to at least twice the slot count so probe chains stay
/// short.
pub(crate) struct SlotTable {
    slots: Vec<UdpSlot>,
    buckets: Vec<Option<u32>>,
    bucket_mask: usize,
    free_head: Option<u32>,
    active_head: Option<u32>,
    active_tail: Option<u32>,
    callback_head: Option<u32>,
    callback_tail: Option<u32>,
    num_used: usize,
    num_used_incoming: usize,
}

impl SlotTable {
    pub fn new(max_slots: usize) -> SlotTable {
        assert!(max_slots > 0 && max_slots < u32::MAX as usize);

        let num_buckets = (2 * max_slots).next_power_of_two();

        let mut slots = Vec::with_capacity(max_slots);
        for i in 0..max_slots {
            let mut slot = UdpSlot::vacant();
            slot.next_free = if i + 1 < max_slots { Some(i as u32 + 1) } else { None };
            slots.push(slot);
        }

        SlotTable {
            slots,
            buckets: vec![None; num_buckets],
            bucket_mask: num_buckets - 1,
            free_head: Some(0),
            active_head: None,
            active_tail: None,
            callback_head: None,
            callback_tail: None,
            num_used: 0,
            num_used_incoming: 0,
        }
    }

    pub fn slot(&self, idx: u32) -> &UdpSlot {
        &self.slots[idx as usize]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut UdpSlot {
        &mut self.slots[idx as usize]
    }

    /// Resolves a public handle, or `None` if the slot was recycled since the
    /// handle was issued.
    pub fn resolve(&self, slot_ref: SlotRef) -> Option<u32> {
        let slot = self.slots.get(slot_ref.index as usize)?;
        if slot.used && slot.generation == slot_ref.generation {
            Some(slot_ref.index)
        } else {
            None
        }
    }

    pub fn slot_ref(&self, idx: u32) -> SlotRef {
        SlotRef {
            index: idx,
            generation: self.slots[idx as usize].generation,
        }
    }

    pub fn num_used(&self) -> usize {
        self.num_used
    }

    pub fn num_used_incoming(&self) -> usize {
        self.num_used_incoming
    }

    pub fn num_available(&self) -> usize {
        self.slots.len() - self.num_used
    }

    pub fn active_head(&self) -> Option<u32> {
        self.active_head
    }

    /// Takes a slot off the free list, initializes it for `key` and links it
    /// into the active list. `None` when the table is full.
    pub fn get_empty(&mut self, key: SlotKey, endpoint: SocketAddr, now: Millis) -> Option<u32> {
        debug_assert!(self.lookup(&key).is_none(), "duplicate slot key");

        let idx = self.free_head?;
        self.free_head = self.slots[idx as usize].next_free;
        self.slots[idx as usize].next_free = None;

        self.slots[idx as usize].recycle(key, endpoint, now);
        self.add_key(key, idx);
        self.push_active_tail(idx);

        self.num_used += 1;
        if key.incoming {
            self.num_used_incoming += 1;
        }
        Some(idx)
    }

    /// Unlinks the slot from every list and the hash and returns it to the
    /// free list. Buffers and callbacks are dropped; the generation is bumped
    /// so outstanding handles go stale.
    pub fn free(&mut self, idx: u32) {
        debug_assert!(self.slots[idx as usize].used);

        let key = self.slots[idx as usize].key;
        self.remove_key(&key);
        self.unlink_active(idx);
        self.remove_from_callback_list(idx);

        let slot = &mut self.slots[idx as usize];
        slot.send_buf = bytes::Bytes::new();
        slot.recv_buf = bytes::BytesMut::new();
        slot.callback = None;
        slot.reply_done = None;
        slot.used = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = Some(idx);

        self.num_used -= 1;
        if key.incoming {
            self.num_used_incoming -= 1;
        }
    }

    pub fn lookup(&self, key: &SlotKey) -> Option<u32> {
        let mut bucket = self.ideal_bucket(key);
        loop {
            match self.buckets[bucket] {
                None => return None,
                Some(idx) if self.slots[idx as usize].key == *key => return Some(idx),
                Some(_) => bucket = (bucket + 1) & self.bucket_mask,
            }
        }
    }

    fn ideal_bucket(&self, key: &SlotKey) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        hasher.finish() as usize & self.bucket_mask
    }

    fn add_key(&mut self, key: SlotKey, idx: u32) {
        let mut bucket = self.ideal_bucket(&key);
        while self.buckets[bucket].is_some() {
            bucket = (bucket + 1) & self.bucket_mask;
        }
        self.buckets[bucket] = Some(idx);
    }

    /// Open-addressing removal with backward shift: entries after the removed
    /// one move up if their ideal bucket is outside the gap, so probe chains
    /// stay unbroken without tombstones.
    fn remove_key(&mut self, key: &SlotKey) {
        let mut gap = self.ideal_bucket(key);
        loop {
            match self.buckets[gap] {
                None => return, // not present
                Some(idx) if self.slots[idx as usize].key == *key => break,
                Some(_) => gap = (gap + 1) & self.bucket_mask,
            }
        }
        self.buckets[gap] = None;

        let mut probe = gap;
        loop {
            probe = (probe + 1) & self.bucket_mask;
            let idx = match self.buckets[probe] {
                None => return,
                Some(idx) => idx,
            };
            let ideal = self.ideal_bucket(&self.slots[idx as usize].key);

            let gap_distance = probe.wrapping_sub(gap) & self.bucket_mask;
            let ideal_distance = probe.wrapping_sub(ideal) & self.bucket_mask;
            if ideal_distance >= gap_distance {
                self.buckets[gap] = Some(idx);
                self.buckets[probe] = None;
                gap = probe;
            }
        }
    }

    pub fn rekey(&mut self, idx: u32, new_key: SlotKey, new_endpoint: SocketAddr) {
        let old_key = self.slots[idx as usize].key;
        self.remove_key(&old_key);
        self.slots[idx as usize].key = new_key;
        self.slots[idx as usize].endpoint = new_endpoint;
        self.add_key(new_key, idx);
    }

    fn push_active_tail(&mut self, idx: u32) {
        self.slots[idx as usize].active_prev = self.active_tail;
        self.slots[idx as usize].active_next = None;
        match self.active_tail {
            Some(tail) => self.slots[tail as usize].active_next = Some(idx),
            None => self.active_head = Some(idx),
        }
        self.active_tail = Some(idx);
    }

    fn unlink_active(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &mut self.slots[idx as usize];
            (slot.active_prev.take(), slot.active_next.take())
        };
        match prev {
            Some(p) => self.slots[p as usize].active_next = next,
            None => self.active_head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].active_prev = prev,
            None => self.active_tail = prev,
        }
    }

    /// Appends the slot to the callback list; a no-op if it is already there.
    /// The slot stays linked into the active list until it is freed.
    pub fn add_to_callback_list(&mut self, idx: u32) {
        if self.slots[idx as usize].in_callback_list {
            return;
        }
        self.slots[idx as usize].in_callback_list = true;
        self.slots[idx as usize].callback_prev = self.callback_tail;
        self.slots[idx as usize].callback_next = None;
        match self.callback_tail {
            Some(tail) => self.slots[tail as usize].callback_next = Some(idx),
            None => self.callback_head = Some(idx),
        }
        self.callback_tail = Some(idx);
    }

    pub fn remove_from_callback_list(&mut self, idx: u32) {
        if !self.slots[idx as usize].in_callback_list {
            return;
        }
        let (prev, next) = {
            let slot = &mut self.slots[idx as usize];
            slot.in_callback_list = false;
            (slot.callback_prev.take(), slot.callback_next.take())
        };
        match prev {
            Some(p) => self.slots[p as usize].callback_next = next,
            None => self.callback_head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].callback_prev = prev,
            None => self.callback_tail = prev,
        }
    }

    pub fn pop_callback_head(&mut self) -> Option<u32> {
        let head = self.callback_head?;
        self.remove_from_callback_list(head);
        Some(head)
    }
}
