//! Connection buffer pool.
//!
//! Provides fixed-size buffers without per-connection allocation on the
//! accept path. Each connection takes a read and a write buffer on accept
//! and hands them back when it is torn down. An exhausted pool means the
//! new connection is dropped; existing connections are unaffected.

/// Pool of pre-allocated, equally sized buffers.
///
/// Buffers are reused in LIFO order so recently released (cache-warm)
/// memory is handed out first.
pub struct BufferPool {
    /// Stack of available buffers.
    free_list: Vec<Vec<u8>>,
    /// Size of each buffer.
    buffer_size: usize,
    /// Total buffers owned by the pool, in use or not.
    capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `count` - Number of buffers to pre-allocate
    /// * `size` - Size of each buffer in bytes
    pub fn new(count: usize, size: usize) -> Self {
        let free_list = (0..count).map(|_| vec![0u8; size]).collect();

        Self {
            free_list,
            buffer_size: size,
            capacity: count,
        }
    }

    /// Take a buffer from the pool.
    ///
    /// Returns `None` if no buffers are available.
    pub fn alloc(&mut self) -> Option<Vec<u8>> {
        self.free_list.pop()
    }

    /// Take a read/write buffer pair.
    ///
    /// Returns `None` if fewer than two buffers are available, leaving the
    /// pool unchanged.
    pub fn alloc_pair(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        if self.free_list.len() < 2 {
            return None;
        }
        let read_buf = self.alloc()?;
        let write_buf = self.alloc()?;
        Some((read_buf, write_buf))
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, buf: Vec<u8>) {
        debug_assert_eq!(buf.len(), self.buffer_size, "foreign buffer returned to pool");
        debug_assert!(self.free_list.len() < self.capacity, "buffer freed twice");
        self.free_list.push(buf);
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of available buffers.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}
