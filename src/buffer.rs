//! Cursor-based byte buffer used for all socket I/O.
//!
//! A `Buffer` is a fixed region of bytes with a read/write cursor
//! (`position`) and a valid-data boundary (`limit`). It follows the usual
//! flip discipline: write into it, `flip()`, read back out, `clear()`.
//! Invariant: `0 <= position <= limit <= capacity`.

/// A byte region with `position` and `limit` cursors.
///
/// Exclusively owned by whichever component allocated it; moving a `Buffer`
/// moves its storage, there is no sharing.
#[derive(Clone)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl Buffer {
    /// Allocate a buffer in write mode: `position = 0`, `limit = capacity`.
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0u8; capacity],
            position: 0,
            limit: capacity,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.limit);
        self.position = position;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit <= self.data.len());
        self.limit = limit;
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes left between the cursor and the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Reset to full write mode: `position = 0`, `limit = capacity`.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Switch from write mode to read mode: `limit = position`, `position = 0`.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Discard contents and reallocate to a new capacity, in write mode.
    pub fn reset_and_grow(&mut self, new_capacity: usize) {
        self.data = vec![0u8; new_capacity];
        self.position = 0;
        self.limit = new_capacity;
    }

    /// The entire backing storage, ignoring the cursors. Used by the socket
    /// layer to receive directly into the buffer before setting the cursors.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid bytes between `position` and `limit`.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Copy `min(self.remaining(), src.remaining())` bytes from `src`'s
    /// cursor to this buffer's cursor, advancing both. The single primitive
    /// all buffered socket I/O is built on.
    pub fn fill_from(&mut self, src: &mut Buffer) {
        let n = self.remaining().min(src.remaining());
        self.data[self.position..self.position + n]
            .copy_from_slice(&src.data[src.position..src.position + n]);
        self.position += n;
        src.position += n;
    }

    // The get_/put_ accessors below do no bounds negotiation of their own:
    // the contract is that the caller has already confirmed enough bytes are
    // available, typically via a fill() that returned complete. A violation
    // panics on the slice bounds check rather than reading garbage.

    /// Read a big-endian u32 at the cursor and advance past it.
    pub fn get_u32(&mut self) -> u32 {
        let v = u32::from_be_bytes(self.data[self.position..self.position + 4].try_into().unwrap());
        self.position += 4;
        v
    }

    /// Read a big-endian u16 at the cursor and advance past it.
    pub fn get_u16(&mut self) -> u16 {
        let v = u16::from_be_bytes(self.data[self.position..self.position + 2].try_into().unwrap());
        self.position += 2;
        v
    }

    /// Read `length` raw bytes at the cursor and advance past them.
    pub fn get_bytes(&mut self, length: usize) -> Vec<u8> {
        let v = self.data[self.position..self.position + length].to_vec();
        self.position += length;
        v
    }

    /// Write a u32 in network byte order at the cursor.
    pub fn put_u32(&mut self, value: u32) {
        self.data[self.position..self.position + 4].copy_from_slice(&value.to_be_bytes());
        self.position += 4;
    }

    /// Write a u16 in network byte order at the cursor.
    pub fn put_u16(&mut self, value: u16) {
        self.data[self.position..self.position + 2].copy_from_slice(&value.to_be_bytes());
        self.position += 2;
    }

    /// Write raw bytes at the cursor.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.data[self.position..self.position + value.len()].copy_from_slice(value);
        self.position += value.len();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.data.len())
            .finish()
    }
}
