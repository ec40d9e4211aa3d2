use std::fmt::{Debug, Formatter};

/// Upper bound on the number of dgrams a single transaction can span. With the
/// default protocol's payload size this allows messages of roughly 700 KiB.
pub const MAX_DGRAMS: usize = 512;

const WORDS: usize = MAX_DGRAMS / 64;

/// Fixed-capacity bitmap with one bit per dgram of a transaction.
///
/// Every slot carries four of these (sent, acked, received, acks-to-send), and
/// slots are recycled on hot paths, so the representation is a flat word array
/// rather than a heap collection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DgramBitmap {
    words: [u64; WORDS],
}

impl Debug for DgramBitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DgramBitmap({} set)", self.count_ones())
    }
}

impl DgramBitmap {
    pub const EMPTY: DgramBitmap = DgramBitmap { words: [0; WORDS] };

    pub fn new() -> DgramBitmap {
        Self::EMPTY
    }

    pub fn set(&mut self, idx: u32) {
        debug_assert!((idx as usize) < MAX_DGRAMS);
        self.words[idx as usize / 64] |= 1 << (idx % 64);
    }

    pub fn clear(&mut self, idx: u32) {
        debug_assert!((idx as usize) < MAX_DGRAMS);
        self.words[idx as usize / 64] &= !(1 << (idx % 64));
    }

    pub fn get(&self, idx: u32) -> bool {
        debug_assert!((idx as usize) < MAX_DGRAMS);
        self.words[idx as usize / 64] & (1 << (idx % 64)) != 0
    }

    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn any_set(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    /// The lowest clear bit strictly below `n`, i.e. the next dgram that still
    /// needs sending out of a transaction of `n` dgrams.
    pub fn first_clear_below(&self, n: u32) -> Option<u32> {
        debug_assert!(n as usize <= MAX_DGRAMS);
        for (w, &word) in self.words.iter().enumerate() {
            let inverted = !word;
            if inverted != 0 {
                let bit = w as u32 * 64 + inverted.trailing_zeros();
                return if bit < n { Some(bit) } else { None };
            }
        }
        None
    }

    pub fn first_set(&self) -> Option<u32> {
        for (w, &word) in self.words.iter().enumerate() {
            if word != 0 {
                return Some(w as u32 * 64 + word.trailing_zeros());
            }
        }
        None
    }

    /// All bits `0..n` set, i.e. every dgram of an `n`-dgram transaction is
    /// accounted for.
    pub fn is_full_below(&self, n: u32) -> bool {
        n > 0 && self.first_clear_below(n).is_none()
    }

    /// Collects the bits `base..base+64` into a word, bit `i` representing
    /// `base + i`. This is the coalesced-ACK encoding on the wire.
    pub fn window_from(&self, base: u32) -> u64 {
        let mut out = 0u64;
        for i in 0..64u32 {
            let idx = base + i;
            if idx as usize >= MAX_DGRAMS {
                break;
            }
            if self.get(idx) {
                out |= 1 << i;
            }
        }
        out
    }

    /// Sets `base + i` for every bit `i` of `mask`, ignoring bits at or beyond
    /// `bound`. The inverse of [Self::window_from] on the receiving side.
    pub fn set_window(&mut self, base: u32, mask: u64, bound: u32) {
        for i in 0..64u32 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let idx = base + i;
            if idx >= bound || idx as usize >= MAX_DGRAMS {
                continue;
            }
            self.set(idx);
        }
    }

    pub fn clear_window(&mut self, base: u32, mask: u64) {
        for i in 0..64u32 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let idx = base + i;
            if (idx as usize) < MAX_DGRAMS {
                self.clear(idx);
            }
        }
    }

    pub fn is_superset_of(&self, other: &DgramBitmap) -> bool {
        self.words.iter().zip(&other.words)
            .all(|(a, b)| a & b == *b)
    }
}
