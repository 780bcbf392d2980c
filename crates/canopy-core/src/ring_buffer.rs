//! Single-producer/single-consumer byte ring shared between the PTY host and
//! the analysis worker.
//!
//! Raw terminal output is framed as
//! `[id_len: u16 LE][terminal id][data_len: u32 LE][data]` so the consumer can
//! route bytes back to the terminal that produced them. `head` and `tail` are
//! monotonically increasing byte counters; a frame only becomes visible to the
//! consumer once `head` has been advanced past its last byte.
//!
//! Exactly one thread may call [`SharedRingBuffer::write_frame`] and exactly
//! one thread may call [`SharedRingBuffer::read_frame`]. Violating that
//! contract garbles frames but is never undefined behaviour.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::error::RingBufferError;

const ID_LEN_BYTES: usize = 2;
const DATA_LEN_BYTES: usize = 4;

/// Bytes of framing overhead added to every frame besides the terminal id.
pub const FRAME_HEADER_LEN: usize = ID_LEN_BYTES + DATA_LEN_BYTES;

/// Default ring size handed out by buffer sources.
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;

/// One chunk of raw output for one terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub terminal_id: String,
    pub data: Vec<u8>,
}

struct RingInner {
    cells: Box<[AtomicU8]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped_frames: AtomicU64,
}

/// Cloneable handle to one shared ring. Clones refer to the same memory.
#[derive(Clone)]
pub struct SharedRingBuffer {
    inner: Arc<RingInner>,
}

impl std::fmt::Debug for SharedRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("dropped_frames", &self.dropped_frames())
            .finish()
    }
}

impl SharedRingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(FRAME_HEADER_LEN + 1);
        let cells = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        Self {
            inner: Arc::new(RingInner {
                cells,
                head: AtomicUsize::new(0),
                tail: AtomicUsize::new(0),
                dropped_frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.cells.len()
    }

    /// Unread bytes currently in the ring.
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames rejected because the consumer had fallen behind.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }

    /// True when both handles point at the same ring.
    pub fn same_ring(&self, other: &SharedRingBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Producer side. Never blocks: a frame that does not fit is dropped and
    /// counted.
    pub fn write_frame(&self, terminal_id: &str, data: &[u8]) -> Result<(), RingBufferError> {
        let id = terminal_id.as_bytes();
        let id_len = u16::try_from(id.len()).map_err(|_| RingBufferError::IdTooLong(id.len()))?;
        let data_len =
            u32::try_from(data.len()).map_err(|_| RingBufferError::FrameTooLarge {
                frame: data.len(),
                capacity: self.capacity(),
            })?;

        let frame_len = FRAME_HEADER_LEN + id.len() + data.len();
        if frame_len > self.capacity() {
            return Err(RingBufferError::FrameTooLarge {
                frame: frame_len,
                capacity: self.capacity(),
            });
        }

        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        let free = self.capacity() - head.wrapping_sub(tail);
        if frame_len > free {
            self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Err(RingBufferError::Full {
                needed: frame_len,
                free,
            });
        }

        let mut cursor = head;
        cursor = self.store(cursor, &id_len.to_le_bytes());
        cursor = self.store(cursor, id);
        cursor = self.store(cursor, &data_len.to_le_bytes());
        cursor = self.store(cursor, data);

        self.inner.head.store(cursor, Ordering::Release);
        Ok(())
    }

    /// Consumer side. Returns `None` when no complete frame is available.
    pub fn read_frame(&self) -> Option<Frame> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if head.wrapping_sub(tail) < FRAME_HEADER_LEN {
            return None;
        }

        let mut cursor = tail;
        let mut id_len = [0u8; ID_LEN_BYTES];
        cursor = self.load(cursor, &mut id_len);
        let mut id = vec![0u8; u16::from_le_bytes(id_len) as usize];
        cursor = self.load(cursor, &mut id);
        let mut data_len = [0u8; DATA_LEN_BYTES];
        cursor = self.load(cursor, &mut data_len);
        let mut data = vec![0u8; u32::from_le_bytes(data_len) as usize];
        cursor = self.load(cursor, &mut data);

        self.inner.tail.store(cursor, Ordering::Release);

        Some(Frame {
            terminal_id: String::from_utf8_lossy(&id).into_owned(),
            data,
        })
    }

    /// Consumer side. Discards everything currently readable.
    pub fn clear(&self) {
        let head = self.inner.head.load(Ordering::Acquire);
        self.inner.tail.store(head, Ordering::Release);
    }

    fn store(&self, start: usize, bytes: &[u8]) -> usize {
        let capacity = self.capacity();
        for (offset, byte) in bytes.iter().enumerate() {
            let index = start.wrapping_add(offset) % capacity;
            self.inner.cells[index].store(*byte, Ordering::Relaxed);
        }
        start.wrapping_add(bytes.len())
    }

    fn load(&self, start: usize, out: &mut [u8]) -> usize {
        let capacity = self.capacity();
        for (offset, slot) in out.iter_mut().enumerate() {
            let index = start.wrapping_add(offset) % capacity;
            *slot = self.inner.cells[index].load(Ordering::Relaxed);
        }
        start.wrapping_add(out.len())
    }
}
