use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Pool of fixed-capacity datagram buffers. The receive loop draws one buffer per datagram;
/// buffers flow through the session's receive ring and come back after the delivered segments
/// have been dispatched. Buffers that never make it back (dropped duplicates, segments still
/// parked in a ring when a session dies) are simply reallocated on demand.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            // a buffer from a different source (e.g. test fixtures) - not worth keeping
            debug!("discarding returned buffer with foreign capacity {}", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
