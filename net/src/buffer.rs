// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Preallocated packet buffers with headroom and per-core caching.
//!
//! A [`BufferPool`] owns a fixed population of byte segments. Allocation
//! first hits a per-core cache (an uncontended striped lock selected by a
//! thread-local slot), refilling in batches from the shared reserve.
//! Dropping the last reference to a [`PacketBuf`] returns its segment to the
//! cache of whichever core freed it.
//!
//! Clones share the payload by reference count. Any mutation of a shared
//! payload first copies the segment into a fresh one, so a clone handed to
//! another port can never observe a later rewrite.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::warn;

/// Bytes of data room in every segment.
pub const DATA_ROOM: usize = 2048;
/// Headroom reserved at allocation, sized to fit a prepended upcall header.
pub const DEFAULT_HEADROOM: usize = 128;
/// Per-core cache capacity, in segments.
const CACHE_SLOTS: usize = 32;
/// Number of per-core cache stripes.
const CACHE_STRIPES: usize = 64;
/// Segments moved between a cache and the reserve at a time.
const REFILL_BATCH: usize = 8;

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static STRIPE: usize = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed) % CACHE_STRIPES;
}

/// Errors reported by buffer operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BufferError {
    /// The pool has no free segments.
    #[error("buffer pool exhausted")]
    Exhausted,
    /// Not enough headroom to prepend `needed` bytes.
    #[error("insufficient headroom: need {needed}, have {available}")]
    NoHeadroom { needed: usize, available: usize },
    /// The requested length does not fit in the segment.
    #[error("frame of {len} bytes exceeds segment room of {room}")]
    TooLong { len: usize, room: usize },
    /// Trim beyond the current frame length.
    #[error("cannot trim {wanted} bytes from a {len} byte frame")]
    TrimBeyondEnd { wanted: usize, len: usize },
}

struct PoolShared {
    reserve: Mutex<Vec<Box<[u8]>>>,
    caches: Box<[CachePadded<Mutex<Vec<Box<[u8]>>>>]>,
    in_flight: AtomicUsize,
    capacity: usize,
}

impl PoolShared {
    fn take_segment(self: &Arc<Self>) -> Option<Box<[u8]>> {
        let stripe = STRIPE.with(|s| *s);
        let mut cache = self.caches[stripe].lock();
        if let Some(seg) = cache.pop() {
            return Some(seg);
        }
        let mut reserve = self.reserve.lock();
        let take = REFILL_BATCH.min(reserve.len());
        if take == 0 {
            return None;
        }
        let at = reserve.len() - take;
        cache.extend(reserve.drain(at..));
        cache.pop()
    }

    fn put_segment(&self, seg: Box<[u8]>) {
        let stripe = STRIPE.with(|s| *s);
        let mut cache = self.caches[stripe].lock();
        cache.push(seg);
        if cache.len() > CACHE_SLOTS {
            let at = cache.len() - REFILL_BATCH.min(cache.len());
            self.reserve.lock().extend(cache.drain(at..));
        }
    }
}

/// A pool of fixed-size packet segments.
///
/// Cheap to clone; all clones draw from the same population.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Preallocate a pool of `capacity` segments.
    #[must_use]
    pub fn new(capacity: usize) -> BufferPool {
        let reserve = (0..capacity)
            .map(|_| vec![0u8; DATA_ROOM].into_boxed_slice())
            .collect();
        let caches = (0..CACHE_STRIPES)
            .map(|_| CachePadded::new(Mutex::new(Vec::with_capacity(CACHE_SLOTS + REFILL_BATCH))))
            .collect();
        BufferPool {
            shared: Arc::new(PoolShared {
                reserve: Mutex::new(reserve),
                caches,
                in_flight: AtomicUsize::new(0),
                capacity,
            }),
        }
    }

    /// Take an empty buffer with [`DEFAULT_HEADROOM`] reserved.
    ///
    /// # Errors
    ///
    /// [`BufferError::Exhausted`] when every segment is in flight.
    pub fn alloc(&self) -> Result<PacketBuf, BufferError> {
        let data = self.shared.take_segment().ok_or(BufferError::Exhausted)?;
        self.shared.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(PacketBuf {
            seg: Arc::new(Segment {
                pool: Arc::downgrade(&self.shared),
                data: Some(data),
            }),
            start: DEFAULT_HEADROOM,
            len: 0,
        })
    }

    /// Allocate and fill with `frame`, keeping the default headroom.
    ///
    /// # Errors
    ///
    /// [`BufferError::Exhausted`] or [`BufferError::TooLong`].
    pub fn alloc_from(&self, frame: &[u8]) -> Result<PacketBuf, BufferError> {
        let mut buf = self.alloc()?;
        buf.fill(frame)?;
        Ok(buf)
    }

    /// Number of segments currently held by live buffers.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    /// Total segment population.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

struct Segment {
    pool: Weak<PoolShared>,
    data: Option<Box<[u8]>>,
}

impl Segment {
    fn data(&self) -> &[u8] {
        // populated from construction until drop
        self.data.as_deref().unwrap_or(&[])
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.in_flight.fetch_sub(1, Ordering::Relaxed);
            pool.put_segment(data);
        }
    }
}

/// A packet buffer: one refcounted segment plus a `[start, start+len)` window.
///
/// `Clone` shares the segment (this is the multi-output clone of the action
/// executor). Mutating accessors make the segment unique first.
pub struct PacketBuf {
    seg: Arc<Segment>,
    start: usize,
    len: usize,
}

impl Clone for PacketBuf {
    fn clone(&self) -> Self {
        PacketBuf {
            seg: Arc::clone(&self.seg),
            start: self.start,
            len: self.len,
        }
    }
}

impl PacketBuf {
    /// Frame bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.seg.data()[self.start..self.start + self.len]
    }

    /// Frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unused bytes before the frame.
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// True when another buffer shares this payload.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.seg) > 1
    }

    /// Mutable frame bytes; copies the segment first when shared.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.make_unique();
        let (start, len) = (self.start, self.len);
        // unique after make_unique
        let seg = Arc::get_mut(&mut self.seg).unwrap_or_else(|| unreachable!());
        let data = seg.data.as_deref_mut().unwrap_or_else(|| unreachable!());
        &mut data[start..start + len]
    }

    /// Overwrite the frame with `frame`, preserving the current headroom.
    ///
    /// # Errors
    ///
    /// [`BufferError::TooLong`] if `frame` does not fit behind the headroom.
    pub fn fill(&mut self, frame: &[u8]) -> Result<(), BufferError> {
        let room = DATA_ROOM - self.start;
        if frame.len() > room {
            return Err(BufferError::TooLong {
                len: frame.len(),
                room,
            });
        }
        self.len = frame.len();
        let dst = self.bytes_mut();
        dst.copy_from_slice(frame);
        Ok(())
    }

    /// Grow the frame by `n` bytes at the front and return the new prefix.
    ///
    /// # Errors
    ///
    /// [`BufferError::NoHeadroom`] when fewer than `n` bytes precede the frame.
    pub fn prepend(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        if n > self.start {
            return Err(BufferError::NoHeadroom {
                needed: n,
                available: self.start,
            });
        }
        self.make_unique();
        self.start -= n;
        self.len += n;
        let start = self.start;
        let seg = Arc::get_mut(&mut self.seg).unwrap_or_else(|| unreachable!());
        let data = seg.data.as_deref_mut().unwrap_or_else(|| unreachable!());
        Ok(&mut data[start..start + n])
    }

    /// Shrink the frame by `n` bytes at the front, reclaiming them as headroom.
    ///
    /// # Errors
    ///
    /// [`BufferError::TrimBeyondEnd`] if `n` exceeds the frame length.
    pub fn trim_front(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.len {
            return Err(BufferError::TrimBeyondEnd {
                wanted: n,
                len: self.len,
            });
        }
        self.start += n;
        self.len -= n;
        Ok(())
    }

    fn make_unique(&mut self) {
        if Arc::get_mut(&mut self.seg).is_some() {
            return;
        }
        let mut fresh = match self.seg.pool.upgrade() {
            Some(pool) => match pool.take_segment() {
                Some(data) => {
                    pool.in_flight.fetch_add(1, Ordering::Relaxed);
                    Segment {
                        pool: Arc::downgrade(&pool),
                        data: Some(data),
                    }
                }
                None => {
                    // pool dry; spill to the heap rather than corrupt a
                    // shared clone
                    warn!("buffer pool dry during copy-on-write, heap segment used");
                    Segment {
                        pool: Weak::new(),
                        data: Some(vec![0u8; DATA_ROOM].into_boxed_slice()),
                    }
                }
            },
            None => Segment {
                pool: Weak::new(),
                data: Some(vec![0u8; DATA_ROOM].into_boxed_slice()),
            },
        };
        fresh
            .data
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!())
            .copy_from_slice(self.seg.data());
        self.seg = Arc::new(fresh);
    }
}

impl core::fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.len)
            .field("headroom", &self.start)
            .field("shared", &self.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_free_round_trip() {
        let pool = BufferPool::new(8);
        assert_eq!(pool.in_flight(), 0);
        let buf = pool.alloc_from(&[1, 2, 3]).unwrap();
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(buf.bytes(), &[1, 2, 3]);
        drop(buf);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn exhaustion_reports_error() {
        let pool = BufferPool::new(2);
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert_eq!(pool.alloc().unwrap_err(), BufferError::Exhausted);
    }

    #[test]
    fn clone_shares_until_written() {
        let pool = BufferPool::new(4);
        let mut orig = pool.alloc_from(&[0xAA; 64]).unwrap();
        let copy = orig.clone();
        assert_eq!(pool.in_flight(), 1);
        assert!(orig.is_shared());

        orig.bytes_mut()[0] = 0x55;
        assert_eq!(copy.bytes()[0], 0xAA);
        assert_eq!(orig.bytes()[0], 0x55);
        assert!(!copy.is_shared());

        drop(orig);
        drop(copy);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn prepend_consumes_headroom() {
        let pool = BufferPool::new(2);
        let mut buf = pool.alloc_from(&[9u8; 10]).unwrap();
        let before = buf.headroom();
        buf.prepend(4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.headroom(), before - 4);
        assert_eq!(buf.len(), 14);
        assert_eq!(&buf.bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(&buf.bytes()[4..], &[9u8; 10]);
    }

    #[test]
    fn prepend_past_headroom_fails() {
        let pool = BufferPool::new(2);
        let mut buf = pool.alloc().unwrap();
        let err = buf.prepend(DEFAULT_HEADROOM + 1).unwrap_err();
        assert!(matches!(err, BufferError::NoHeadroom { .. }));
    }

    #[test]
    fn trim_front_reclaims_headroom() {
        let pool = BufferPool::new(2);
        let mut buf = pool.alloc_from(&[1, 2, 3, 4, 5]).unwrap();
        buf.trim_front(2).unwrap();
        assert_eq!(buf.bytes(), &[3, 4, 5]);
        assert_eq!(buf.headroom(), DEFAULT_HEADROOM + 2);
        assert!(buf.trim_front(4).is_err());
    }
}
