//! Pooled packet buffers with a reserved header region.
//!
//! Each pump owns one pool outright, so no synchronization is needed.
//! Buffers come back with the first `header_len` bytes re-zeroed so
//! the TUN driver can be handed `[header space][payload]` directly.

/// Fixed-size buffer pool. `get` hands out a buffer of
/// `header_len + payload_capacity` bytes with the header region
/// zeroed; `put` returns it. The pool keeps at most `max_buffers`
/// buffers; surplus returns are dropped.
#[derive(Debug)]
pub struct BufferPool {
    header_len: usize,
    buf_len: usize,
    max_buffers: usize,
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn new(header_len: usize, payload_capacity: usize, max_buffers: usize) -> Self {
        Self {
            header_len,
            buf_len: header_len + payload_capacity,
            max_buffers,
            free: Vec::with_capacity(max_buffers),
        }
    }

    /// Take a buffer from the pool, allocating if the pool is empty.
    pub fn get(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(buf) => buf,
            None => vec![0u8; self.buf_len],
        }
    }

    /// Return a buffer. Buffers of the wrong size (callers must not
    /// shrink them) and overflow beyond `max_buffers` are dropped.
    pub fn put(&mut self, mut buf: Vec<u8>) {
        if buf.len() != self.buf_len || self.free.len() >= self.max_buffers {
            return;
        }
        buf[..self.header_len].fill(0);
        self.free.push(buf);
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }
}
