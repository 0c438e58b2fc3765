use crate::addr_set::AddrSet;

/// Byte addressable memory exposed by an emulator.
///
/// `read` and `write` are the accesses performed by the emulated program and are observable by
/// instrumentation. `peek` and `poke` are side-channel accesses used by tooling.
pub trait Memory {
    fn read(&mut self, addr: u32) -> u8;
    fn peek(&self, addr: u32) -> u8;
    fn write(&mut self, addr: u32, value: u8);
    fn poke(&mut self, addr: u32, value: u8);
    fn size(&self) -> usize;
}

/// Copies the full contents of `memory` without triggering any instrumentation.
pub fn snapshot(memory: &(impl Memory + ?Sized)) -> Vec<u8> {
    (0..memory.size() as u32).map(|addr| memory.peek(addr)).collect()
}

/// Plain fixed-size memory. Accesses outside of the memory read as zero and ignore writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteMemory {
    bytes: Vec<u8>,
}

impl ByteMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }

    /// Replaces the start of memory with `data`, clearing everything after it.
    pub fn load(&mut self, data: &[u8]) {
        let len = data.len().min(self.bytes.len());
        if len < data.len() {
            tracing::warn!("truncating {} byte image to {} bytes", data.len(), len);
        }
        self.bytes[..len].copy_from_slice(&data[..len]);
        self.bytes[len..].fill(0);
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

impl Memory for ByteMemory {
    fn read(&mut self, addr: u32) -> u8 {
        self.peek(addr)
    }

    fn peek(&self, addr: u32) -> u8 {
        self.bytes.get(addr as usize).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: u32, value: u8) {
        self.poke(addr, value)
    }

    fn poke(&mut self, addr: u32, value: u8) {
        if let Some(slot) = self.bytes.get_mut(addr as usize) {
            *slot = value;
        }
    }

    fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Wraps a memory and, while a read trace is registered, records every address passed to
/// [`Memory::read`].
pub struct InstrumentedMemory<M> {
    inner: M,
    reads: Option<AddrSet>,
}

impl<M: Memory> InstrumentedMemory<M> {
    pub fn new(inner: M) -> Self {
        Self { inner, reads: None }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.inner
    }

    /// Start recording reads. Any trace that was already registered is discarded.
    pub fn register(&mut self) {
        if self.reads.is_some() {
            tracing::warn!("replacing a read trace that was never unregistered");
        }
        self.reads = Some(AddrSet::with_capacity(self.inner.size()));
    }

    /// Stop recording reads, returning the addresses read since [`Self::register`].
    pub fn unregister(&mut self) -> Option<AddrSet> {
        self.reads.take()
    }

    pub fn is_registered(&self) -> bool {
        self.reads.is_some()
    }
}

impl<M: Memory> Memory for InstrumentedMemory<M> {
    fn read(&mut self, addr: u32) -> u8 {
        if let Some(reads) = self.reads.as_mut() {
            reads.insert(addr);
        }
        self.inner.read(addr)
    }

    fn peek(&self, addr: u32) -> u8 {
        self.inner.peek(addr)
    }

    fn write(&mut self, addr: u32, value: u8) {
        self.inner.write(addr, value)
    }

    fn poke(&mut self, addr: u32, value: u8) {
        self.inner.poke(addr, value)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_reads_are_traced() {
        let mut mem = InstrumentedMemory::new(ByteMemory::new(16));
        mem.read(1);
        assert!(!mem.is_registered());

        mem.register();
        mem.read(2);
        mem.peek(3);
        mem.write(4, 0xaa);
        mem.poke(5, 0xbb);
        mem.read(4);

        let reads = mem.unregister().unwrap();
        assert_eq!(reads.iter().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(mem.peek(4), 0xaa);
        assert!(mem.unregister().is_none());
    }

    #[test]
    fn load_truncates_and_clears() {
        let mut mem = ByteMemory::new(4);
        mem.poke(3, 7);
        mem.load(&[1, 2]);
        assert_eq!(snapshot(&mem), vec![1, 2, 0, 0]);
        mem.load(&[1, 2, 3, 4, 5]);
        assert_eq!(snapshot(&mem), vec![1, 2, 3, 4]);
    }
}
