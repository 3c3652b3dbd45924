//! Pool of reader fill buffers.
//!
//! Every journal reader borrows one scratch buffer for frame reads and
//! returns it on close, which bounds allocation pressure when many cursors
//! come and go.

use parking_lot::Mutex;

pub struct BufPool {
    buf_size: usize,
    max_pooled: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufPool {
    pub fn new(buf_size: usize, max_pooled: usize) -> Self {
        Self {
            buf_size,
            max_pooled,
            bufs: Mutex::new(Vec::new()),
        }
    }

    /// Size of the buffers this pool hands out.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.bufs.lock().pop() {
            return buf;
        }
        vec![0u8; self.buf_size]
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        // oversized buffers grew past the pool class, drop them
        if buf.capacity() > 4 * self.buf_size {
            return;
        }
        let mut bufs = self.bufs.lock();
        if bufs.len() < self.max_pooled {
            buf.resize(self.buf_size, 0);
            bufs.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufPool::new(64, 2);
        let a = pool.get();
        assert_eq!(a.len(), 64);
        pool.put(a);
        assert_eq!(pool.bufs.lock().len(), 1);
        let _ = pool.get();
        assert_eq!(pool.bufs.lock().len(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufPool::new(8, 1);
        pool.put(vec![0; 8]);
        pool.put(vec![0; 8]);
        assert_eq!(pool.bufs.lock().len(), 1);
    }
}
