/// Max size of all pooled buffers, in bytes (1 GiB).
const MAX_BUFFERS_SIZE: usize = 1024 * 1024 * 1024;
/// When total pooled bytes exceed this, trim largest buffers down to this level.
const TRIM_THRESHOLD: usize = MAX_BUFFERS_SIZE / 2;

/// Tracks pool usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Current total capacity of all pooled buffers, in bytes.
    pub current_size: usize,
    /// Number of times a buffer was reused instead of allocated.
    pub hits: usize,
    /// Number of times a new buffer was allocated.
    pub misses: usize,
    /// Number of times a buffer was dropped due to pool size cap.
    pub drops: usize,
}

/// Reuses output allocations of a plan across runs.
#[derive(Debug, Default)]
pub struct BufferPool {
    pool: Vec<Vec<u8>>,
    metrics: PoolMetrics,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grab a zeroed buffer of exactly `len` bytes, reusing the smallest
    /// pooled allocation that fits.
    pub fn get_buffer(&mut self, len: usize) -> Vec<u8> {
        let best = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= len)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i);

        match best {
            Some(idx) => {
                self.metrics.hits += 1;
                let mut buf = self.pool.swap_remove(idx);
                self.metrics.current_size = self.metrics.current_size.saturating_sub(buf.capacity());
                buf.clear();
                buf.resize(len, 0);
                debug_assert_eq!(self.metrics.current_size, self.pooled_bytes());
                buf
            }
            None => {
                self.metrics.misses += 1;
                vec![0; len]
            }
        }
    }

    /// Return a buffer into the pool for reuse.
    pub fn recycle_buffer(&mut self, buf: Vec<u8>) {
        let bytes = buf.capacity();
        if bytes == 0 {
            return;
        }
        if self.metrics.current_size + bytes <= MAX_BUFFERS_SIZE {
            self.metrics.current_size += bytes;
            self.pool.push(buf);
            self.trim_excess();
        } else {
            self.metrics.drops += 1;
        }
    }

    /// Remove largest buffers until total pooled bytes <= TRIM_THRESHOLD.
    fn trim_excess(&mut self) {
        while self.metrics.current_size > TRIM_THRESHOLD {
            let Some((idx, bytes)) = self
                .pool
                .iter()
                .enumerate()
                .map(|(i, b)| (i, b.capacity()))
                .max_by_key(|(_, c)| *c)
            else {
                break;
            };
            self.pool.swap_remove(idx);
            self.metrics.current_size = self.metrics.current_size.saturating_sub(bytes);
        }
        debug_assert_eq!(self.metrics.current_size, self.pooled_bytes());
    }

    fn pooled_bytes(&self) -> usize {
        self.pool.iter().map(|b| b.capacity()).sum()
    }

    /// Returns a snapshot of current pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffer_is_reused_and_zeroed() {
        let mut pool = BufferPool::new();
        let mut buf = pool.get_buffer(16);
        buf.fill(7);
        pool.recycle_buffer(buf);

        let buf = pool.get_buffer(8);
        assert_eq!(buf, vec![0; 8]);
        let m = pool.metrics();
        assert_eq!((m.hits, m.misses), (1, 1));
        assert_eq!(m.current_size, 0);
    }

    #[test]
    fn picks_smallest_fitting_buffer() {
        let mut pool = BufferPool::new();
        pool.recycle_buffer(Vec::with_capacity(64));
        pool.recycle_buffer(Vec::with_capacity(8));
        let buf = pool.get_buffer(4);
        assert!(buf.capacity() < 64);
        assert_eq!(pool.metrics().current_size, 64);
    }
}
