//! In-memory snapshot of the target binary region being patched.
//!
//! Supplied by the caller; conditional writes verify against it and the
//! whole record set can be applied to it in place. There is no live device
//! access anywhere in the engine.

/// A snapshot of target memory, addressed absolutely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Absolute address of the first byte of `data`
    base: u32,
    /// Raw big-endian contents
    data: Vec<u8>,
}

impl Image {
    /// Wraps a byte blob that lives at `base` in the target address space
    pub fn new(base: u32, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    /// Absolute address of the first byte
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Whether `len` bytes at `addr` fall entirely inside the snapshot
    pub fn contains(&self, addr: u32, len: usize) -> bool {
        match addr.checked_sub(self.base) {
            Some(offset) => (offset as usize)
                .checked_add(len)
                .is_some_and(|end| end <= self.data.len()),
            None => false,
        }
    }

    /// Reads `len` bytes at `addr`, or `None` if outside the snapshot
    pub fn read(&self, addr: u32, len: usize) -> Option<&[u8]> {
        if !self.contains(addr, len) {
            return None;
        }
        let offset = (addr - self.base) as usize;
        Some(&self.data[offset..offset + len])
    }

    /// Reads a big-endian word at `addr`
    pub fn read_u32(&self, addr: u32) -> Option<u32> {
        self.read(addr, 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Writes `bytes` at `addr`, returning whether the write landed inside
    /// the snapshot
    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> bool {
        if !self.contains(addr, bytes.len()) {
            return false;
        }
        let offset = (addr - self.base) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        true
    }

    /// Consumes the snapshot and returns its contents
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
