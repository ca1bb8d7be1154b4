//! Bit sets over the addresses of a segment.

use std::ops::Range;

const WORD_BITS: u64 = u64::BITS as u64;

/// Set of addresses in `[vbase, vlimit)`, one bit per byte address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    vbase: u64,
    vlimit: u64,
    words: Vec<u64>,
}

impl AddressSet {
    pub fn new(vbase: u64, vlimit: u64) -> Self {
        let size = vlimit.saturating_sub(vbase);
        let words = size.div_ceil(WORD_BITS) as usize;
        Self {
            vbase,
            vlimit,
            words: vec![0; words],
        }
    }

    pub fn in_range(&self, addr: u64) -> bool {
        addr >= self.vbase && addr < self.vlimit
    }

    fn position(&self, addr: u64) -> Option<(usize, u64)> {
        if !self.in_range(addr) {
            return None;
        }
        let offset = addr - self.vbase;
        Some(((offset / WORD_BITS) as usize, 1u64 << (offset % WORD_BITS)))
    }

    /// Add `addr`; addresses outside the segment are ignored.
    pub fn insert(&mut self, addr: u64) {
        if let Some((word, bit)) = self.position(addr) {
            self.words[word] |= bit;
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.position(addr)
            .is_some_and(|(word, bit)| self.words[word] & bit != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Call `f` with each maximal run of consecutive member addresses.
    pub fn for_each_set_range<F: FnMut(Range<u64>)>(&self, mut f: F) {
        let mut run: Option<Range<u64>> = None;
        for addr in self.iter() {
            match run.as_mut() {
                Some(r) if r.end == addr => r.end += 1,
                _ => {
                    if let Some(r) = run.take() {
                        f(r);
                    }
                    run = Some(addr..addr + 1);
                }
            }
        }
        if let Some(r) = run {
            f(r);
        }
    }

    /// Member addresses in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let vbase = self.vbase;
        self.words.iter().enumerate().flat_map(move |(i, &word)| {
            set_bits(word).map(move |bit| vbase + i as u64 * WORD_BITS + bit)
        })
    }

    /// Addresses in `targets` that are not in `valid`, or that are in
    /// `removed`. All three sets must cover the same range. Words with no
    /// such address are skipped whole.
    pub fn bad_targets(targets: &AddressSet, valid: &AddressSet, removed: &AddressSet) -> Vec<u64> {
        let mut bad = Vec::new();
        for (i, &target) in targets.words.iter().enumerate() {
            let word = target & (!valid.word(i) | removed.word(i));
            bad.extend(set_bits(word).map(|bit| targets.vbase + i as u64 * WORD_BITS + bit));
        }
        bad
    }

    fn word(&self, i: usize) -> u64 {
        self.words.get(i).copied().unwrap_or(0)
    }
}

fn set_bits(mut word: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        if word == 0 {
            return None;
        }
        let bit = word.trailing_zeros() as u64;
        word &= word - 1;
        Some(bit)
    })
}
