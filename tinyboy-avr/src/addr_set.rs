//! A dense bitset over flash byte addresses.
//!
//! Used both for the statically computed set of reachable instruction bytes and for the set of
//! code addresses observed while an input executes.

/// Count all bits (i.e. ones) within an array
#[must_use]
fn count_all_bits(array: &[u64]) -> usize {
    array.iter().map(|x| x.count_ones() as usize).sum()
}

/// Returns an iterator of the bit index of all the bits in `array`
fn bit_iter(array: &[u64]) -> impl Iterator<Item = u32> + '_ {
    array.iter().enumerate().flat_map(move |(word_offset, &word)| {
        (0..u64::BITS)
            .filter(move |bit| (word & (1 << bit)) != 0)
            .map(move |bit| (word_offset * 64) as u32 + bit)
    })
}

/// Check whether `new` contains any bits not set in `existing`. Words missing from either side are
/// treated as zero.
#[inline]
fn has_new_bits(existing: &[u64], new: &[u64]) -> bool {
    let len = new.len().min(existing.len());
    let (new, tail) = new.split_at(len);
    if tail.iter().any(|&x| x != 0) {
        return true;
    }
    let existing = &existing[..len];

    // This is done in chunks to aid auto-vectorization. Both sides have the same length here, so
    // their remainders line up.
    let mut new_chunks = new.chunks_exact(4);
    let mut existing_chunks = existing.chunks_exact(4);
    for (new, existing) in (&mut new_chunks).zip(&mut existing_chunks) {
        let change = (!existing[0] & new[0])
            | (!existing[1] & new[1])
            | (!existing[2] & new[2])
            | (!existing[3] & new[3]);
        if change != 0 {
            return true;
        }
    }
    new_chunks.remainder().iter().zip(existing_chunks.remainder()).any(|(n, e)| !e & n != 0)
}

/// Or the bits from `new` with `existing` returning the total number of bits set.
fn or_bits(existing: &mut Vec<u64>, new: &[u64]) -> usize {
    if existing.len() < new.len() {
        existing.resize(new.len(), 0);
    }
    for (new, existing) in new.iter().zip(existing.iter_mut()) {
        *existing |= *new;
    }
    count_all_bits(existing)
}

#[derive(Clone, Default)]
pub struct AddrSet {
    bits: Vec<u64>,
}

impl AddrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty set that can hold addresses `0..len` without reallocating.
    pub fn with_capacity(len: usize) -> Self {
        Self { bits: vec![0; len.div_ceil(64)] }
    }

    pub fn insert(&mut self, addr: u32) {
        let (word, bit) = (addr as usize / 64, addr % 64);
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= 1 << bit;
    }

    /// Inserts every address in `start..start + len`.
    pub fn insert_range(&mut self, start: u32, len: u32) {
        (start..start + len).for_each(|addr| self.insert(addr));
    }

    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        self.bits.get(addr as usize / 64).map_or(false, |word| word & (1 << (addr % 64)) != 0)
    }

    pub fn len(&self) -> usize {
        count_all_bits(&self.bits)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&x| x == 0)
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Iterates the addresses in the set in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        bit_iter(&self.bits)
    }

    /// Adds every address in `other` to `self`, returning the number of addresses now in the set.
    pub fn union_with(&mut self, other: &AddrSet) -> usize {
        or_bits(&mut self.bits, &other.bits)
    }

    /// Returns the addresses present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &AddrSet) -> AddrSet {
        let bits = self.bits.iter().zip(&other.bits).map(|(a, b)| a & b).collect();
        AddrSet { bits }
    }

    /// Returns whether `other` contains any address not already in `self`.
    pub fn has_new(&self, other: &AddrSet) -> bool {
        has_new_bits(&self.bits, &other.bits)
    }

    pub fn is_subset(&self, other: &AddrSet) -> bool {
        !other.has_new(self)
    }
}

impl PartialEq for AddrSet {
    fn eq(&self, other: &Self) -> bool {
        let (short, long) = match self.bits.len() <= other.bits.len() {
            true => (&self.bits, &other.bits),
            false => (&other.bits, &self.bits),
        };
        short == &long[..short.len()] && long[short.len()..].iter().all(|&x| x == 0)
    }
}

impl Eq for AddrSet {}

impl std::fmt::Debug for AddrSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter().map(|addr| format!("{addr:#06x}"))).finish()
    }
}

impl FromIterator<u32> for AddrSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = AddrSet::new();
        iter.into_iter().for_each(|addr| set.insert(addr));
        set
    }
}
