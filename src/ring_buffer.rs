use core::cmp;

/// Fixed-capacity byte FIFO.
///
/// Used both for the raw receive ring of a multiplexer link, where frames
/// are decoded in place through [`peek_at`](RingBuffer::peek_at) and
/// [`consume`](RingBuffer::consume), and for per-channel receive buffers.
#[derive(Debug)]
pub struct RingBuffer<const N: usize> {
    storage: [u8; N],
    read_at: usize,
    length: usize,
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RingBuffer<N> {
    pub const fn new() -> Self {
        Self {
            storage: [0; N],
            read_at: 0,
            length: 0,
        }
    }

    pub fn clear(&mut self) {
        self.read_at = 0;
        self.length = 0;
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.length
    }

    /// Number of bytes that can still be enqueued.
    pub fn window(&self) -> usize {
        N - self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_full(&self) -> bool {
        self.window() == 0
    }

    /// Fill level in whole percent, rounded down.
    pub fn fill_percent(&self) -> usize {
        if N == 0 {
            return 100;
        }
        self.length * 100 / N
    }

    fn get_idx(&self, idx: usize) -> usize {
        if N > 0 {
            (self.read_at + idx) % N
        } else {
            0
        }
    }

    /// Contiguous free region starting at the tail.
    fn contiguous_window(&self) -> usize {
        cmp::min(self.window(), N - self.get_idx(self.length))
    }

    /// Enqueue as much of `data` as fits and return how many bytes were taken.
    pub fn enqueue_slice(&mut self, data: &[u8]) -> usize {
        if self.length == 0 {
            self.read_at = 0;
        }

        let mut written = 0;
        // At most two passes: up to the end of storage, then from the start.
        for _ in 0..2 {
            let at = self.get_idx(self.length);
            let size = cmp::min(self.contiguous_window(), data.len() - written);
            self.storage[at..at + size].copy_from_slice(&data[written..written + size]);
            self.length += size;
            written += size;
        }
        written
    }

    /// Dequeue into `data` and return how many bytes were copied.
    pub fn dequeue_slice(&mut self, data: &mut [u8]) -> usize {
        let size = self.read_allocated(0, data);
        self.consume(size);
        size
    }

    /// Copy allocated bytes starting `offset` bytes past the head into `data`
    /// without dequeueing them.
    pub fn read_allocated(&self, offset: usize, data: &mut [u8]) -> usize {
        if offset >= self.length {
            return 0;
        }
        let size = cmp::min(self.length - offset, data.len());
        for (i, b) in data[..size].iter_mut().enumerate() {
            *b = self.storage[self.get_idx(offset + i)];
        }
        size
    }

    /// Byte `offset` positions past the head, if present.
    pub fn peek_at(&self, offset: usize) -> Option<u8> {
        if offset < self.length {
            Some(self.storage[self.get_idx(offset)])
        } else {
            None
        }
    }

    /// Drop up to `count` bytes from the head.
    pub fn consume(&mut self, count: usize) {
        let count = cmp::min(count, self.length);
        self.read_at = self.get_idx(count);
        self.length -= count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_length_changes() {
        let mut ring: RingBuffer<4> = RingBuffer::new();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.window(), 4);

        assert_eq!(ring.enqueue_slice(b"abc"), 3);
        assert!(!ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.window(), 1);
        assert_eq!(ring.fill_percent(), 75);

        assert_eq!(ring.enqueue_slice(b"de"), 1);
        assert!(ring.is_full());
        assert_eq!(ring.fill_percent(), 100);
    }

    #[test]
    fn test_buffer_wraps_around() {
        let mut ring: RingBuffer<6> = RingBuffer::new();
        assert_eq!(ring.enqueue_slice(b"abcd"), 4);

        let mut out = [0u8; 3];
        assert_eq!(ring.dequeue_slice(&mut out), 3);
        assert_eq!(&out, b"abc");

        assert_eq!(ring.enqueue_slice(b"efghij"), 5);
        assert_eq!(ring.len(), 6);

        let mut out = [0u8; 8];
        assert_eq!(ring.dequeue_slice(&mut out), 6);
        assert_eq!(&out[..6], b"defghi");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_buffer_peek_and_consume() {
        let mut ring: RingBuffer<4> = RingBuffer::new();
        ring.enqueue_slice(b"xyz");
        ring.consume(2);
        ring.enqueue_slice(b"123");

        assert_eq!(ring.peek_at(0), Some(b'z'));
        assert_eq!(ring.peek_at(3), Some(b'3'));
        assert_eq!(ring.peek_at(4), None);

        let mut out = [0u8; 2];
        assert_eq!(ring.read_allocated(1, &mut out), 2);
        assert_eq!(&out, b"12");
        assert_eq!(ring.len(), 4);

        ring.consume(10);
        assert!(ring.is_empty());
        assert_eq!(ring.peek_at(0), None);
    }

    #[test]
    fn test_buffer_clear() {
        let mut ring: RingBuffer<3> = RingBuffer::new();
        ring.enqueue_slice(b"abc");
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.window(), 3);
    }
}
