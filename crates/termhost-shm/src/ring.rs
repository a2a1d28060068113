//! Lock-free (across processes) byte ring over a shared memory map.
//!
//! The first [`HEADER_LEN`] bytes of the region hold the coordination state:
//! - bytes 0..8:   write cursor, `u64`, only ever advanced by the writer
//! - bytes 8..16:  read cursor, `u64`, only ever advanced by the reader
//! - bytes 16..20: detached flag, `u32`, set by a consumer that went away
//!
//! Cursors are monotonic byte counts; positions in the data area are the
//! cursor modulo capacity. The writer publishes with `Release` after copying,
//! the reader observes with `Acquire`, so a frame becomes visible all at once.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use memmap2::MmapMut;
use thiserror::Error;

use crate::framer::{unframe_all, FrameError, Packet};

/// Size of the coordination header at the start of every region.
pub const HEADER_LEN: usize = 64;

const WRITE_CURSOR: usize = 0;
const READ_CURSOR: usize = 8;
const DETACHED_FLAG: usize = 16;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("failed to open shared region {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to map shared region: {0}")]
    Map(#[source] io::Error),
    #[error("shared region of {0} bytes leaves no room for data after the {HEADER_LEN} byte header")]
    TooSmall(usize),
}

/// A fixed-capacity ring of bytes shared with one consumer.
///
/// Any number of threads in this process may call [`RingBuffer::write`];
/// they are serialized by an in-process mutex so the region only ever sees a
/// single writer. The same holds for [`RingBuffer::read`].
pub struct RingBuffer {
    // Keeps the mapping alive; all access goes through `base`.
    _map: MmapMut,
    base: NonNull<u8>,
    capacity: usize,
    writer: Mutex<()>,
    reader: Mutex<()>,
}

// SAFETY: the mapping is owned for the lifetime of the struct, header fields
// are only touched through atomics, and data-area access is partitioned by
// the cursors with writer/reader mutexes serializing each side.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a process-private ring with `capacity` data bytes.
    pub fn anonymous(capacity: usize) -> Result<Self, RingError> {
        let map = MmapMut::map_anon(HEADER_LEN + capacity).map_err(RingError::Map)?;
        Self::from_map(map)
    }

    /// Create (or truncate) a file-backed region with `capacity` data bytes.
    ///
    /// Used by the owning process; the host normally calls [`RingBuffer::open`].
    pub fn create(path: &Path, capacity: usize) -> Result<Self, RingError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| RingError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        file.set_len((HEADER_LEN + capacity) as u64)
            .map_err(RingError::Map)?;

        // SAFETY: the file was just sized by us; concurrent resizing by another
        // process is outside the transport contract.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(RingError::Map)?;
        Self::from_map(map)
    }

    /// Map an existing region created by the owning process.
    pub fn open(path: &Path) -> Result<Self, RingError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| RingError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        // SAFETY: see `create`.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(RingError::Map)?;
        Self::from_map(map)
    }

    fn from_map(mut map: MmapMut) -> Result<Self, RingError> {
        let len = map.len();
        if len <= HEADER_LEN {
            return Err(RingError::TooSmall(len));
        }
        let base = NonNull::from(&mut map[..]).cast::<u8>();
        Ok(Self {
            _map: map,
            base,
            capacity: len - HEADER_LEN,
            writer: Mutex::new(()),
            reader: Mutex::new(()),
        })
    }

    fn header_u64(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: offset is inside the header and 8-byte aligned (maps are
        // page aligned); the header outlives `&self`.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn detached_flag(&self) -> &AtomicU32 {
        // SAFETY: as for `header_u64`.
        unsafe { &*(self.base.as_ptr().add(DETACHED_FLAG) as *const AtomicU32) }
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: HEADER_LEN < map length, checked in `from_map`.
        unsafe { self.base.as_ptr().add(HEADER_LEN) }
    }

    /// Number of data bytes the ring can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written but not yet consumed.
    pub fn unread(&self) -> usize {
        let write = self.header_u64(WRITE_CURSOR).load(Ordering::Acquire);
        let read = self.header_u64(READ_CURSOR).load(Ordering::Acquire);
        (write.wrapping_sub(read) as usize).min(self.capacity)
    }

    /// Bytes available to the writer.
    pub fn free_space(&self) -> usize {
        self.capacity - self.unread()
    }

    /// Fill level in percent, `0.0..=100.0`.
    pub fn utilization(&self) -> f64 {
        self.unread() as f64 / self.capacity as f64 * 100.0
    }

    /// Whether the consumer has flagged itself as gone.
    pub fn is_detached(&self) -> bool {
        self.detached_flag().load(Ordering::Acquire) != 0
    }

    /// Flag the consumer as gone. Called by the consumer on teardown.
    pub fn mark_detached(&self) {
        self.detached_flag().store(1, Ordering::Release);
    }

    /// Write a whole frame.
    ///
    /// Returns the number of bytes written: either `frame.len()` or 0 when the
    /// ring lacks room for the entire frame. A frame is never split across
    /// two writes.
    pub fn write(&self, frame: &[u8]) -> usize {
        self.try_write(frame).map_or(0, |_| frame.len())
    }

    /// Like [`RingBuffer::write`], but returns the write cursor just past the
    /// frame. The consumer has seen the frame once its read cursor reaches
    /// that value.
    pub fn try_write(&self, frame: &[u8]) -> Option<u64> {
        if frame.is_empty() || frame.len() > self.capacity {
            return None;
        }

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        // Only this side moves the write cursor.
        let write = self.header_u64(WRITE_CURSOR).load(Ordering::Relaxed);
        let read = self.header_u64(READ_CURSOR).load(Ordering::Acquire);
        let used = write.wrapping_sub(read) as usize;
        if used > self.capacity || frame.len() > self.capacity - used {
            return None;
        }

        let start = (write % self.capacity as u64) as usize;
        let first = (self.capacity - start).min(frame.len());
        // SAFETY: `[start, start + first)` and `[0, frame.len() - first)` lie in
        // the data area and in the free region, which the reader does not touch.
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), self.data_ptr().add(start), first);
            if first < frame.len() {
                ptr::copy_nonoverlapping(
                    frame.as_ptr().add(first),
                    self.data_ptr(),
                    frame.len() - first,
                );
            }
        }

        let end = write + frame.len() as u64;
        self.header_u64(WRITE_CURSOR).store(end, Ordering::Release);
        Some(end)
    }

    /// The consumer's read cursor.
    pub fn read_position(&self) -> u64 {
        self.header_u64(READ_CURSOR).load(Ordering::Acquire)
    }

    /// Consumer side: copy up to `out.len()` unread bytes and release them.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let _guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);

        let read = self.header_u64(READ_CURSOR).load(Ordering::Relaxed);
        let write = self.header_u64(WRITE_CURSOR).load(Ordering::Acquire);
        let available = (write.wrapping_sub(read) as usize).min(self.capacity);
        let n = available.min(out.len());
        if n == 0 {
            return 0;
        }

        let start = (read % self.capacity as u64) as usize;
        let first = (self.capacity - start).min(n);
        // SAFETY: the range `[read, read + n)` was published by the writer and
        // will not be overwritten until the read cursor moves past it.
        unsafe {
            ptr::copy_nonoverlapping(self.data_ptr().add(start), out.as_mut_ptr(), first);
            if first < n {
                ptr::copy_nonoverlapping(self.data_ptr(), out.as_mut_ptr().add(first), n - first);
            }
        }

        self.header_u64(READ_CURSOR)
            .store(read + n as u64, Ordering::Release);
        n
    }

    /// Consumer side: drain everything currently readable and decode it.
    ///
    /// Frames are published whole, so a full drain never ends mid-frame.
    pub fn drain_packets(&self) -> Result<Vec<Packet>, FrameError> {
        let mut buf = vec![0u8; self.unread()];
        let n = self.read(&mut buf);
        buf.truncate(n);
        let (packets, _) = unframe_all(&buf)?;
        Ok(packets)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("unread", &self.unread())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::frame;

    #[test]
    fn test_ten_frames_into_8k() {
        let ring = RingBuffer::anonymous(8 * 1024).unwrap();
        // 1 KiB frames including the 5 + 2 byte header.
        let payload = vec![b'x'; 1024 - 7];
        let packet = frame("t1", &payload).unwrap();
        assert_eq!(packet.len(), 1024);

        let results: Vec<usize> = (0..10).map(|_| ring.write(&packet)).collect();
        assert_eq!(&results[..8], &[1024; 8]);
        assert_eq!(results[8], 0, "first overflowing write must report full");
        assert_eq!(results[9], 0);
        assert_eq!(ring.utilization(), 100.0);
    }

    #[test]
    fn test_full_ring_writes_nothing() {
        let ring = RingBuffer::anonymous(100).unwrap();
        assert_eq!(ring.write(&[1u8; 60]), 60);
        assert_eq!(ring.write(&[2u8; 50]), 0);
        assert_eq!(ring.unread(), 60);

        let mut out = [0u8; 100];
        assert_eq!(ring.read(&mut out), 60);
        assert!(out[..60].iter().all(|&b| b == 1));
    }

    #[test]
    fn test_try_write_reports_end_cursor() {
        let ring = RingBuffer::anonymous(64).unwrap();
        assert_eq!(ring.try_write(&[1u8; 20]), Some(20));
        assert_eq!(ring.try_write(&[2u8; 30]), Some(50));
        assert_eq!(ring.try_write(&[3u8; 30]), None);

        let mut out = [0u8; 20];
        ring.read(&mut out);
        assert_eq!(ring.read_position(), 20);
        assert_eq!(ring.try_write(&[3u8; 30]), Some(80));
    }

    #[test]
    fn test_wraparound_preserves_bytes() {
        let ring = RingBuffer::anonymous(16).unwrap();
        let mut out = [0u8; 16];

        assert_eq!(ring.write(&[0u8; 10]), 10);
        assert_eq!(ring.read(&mut out[..10]), 10);

        // Next write starts at offset 10 and wraps past the end.
        let data: Vec<u8> = (1..=12).collect();
        assert_eq!(ring.write(&data), 12);
        assert_eq!(ring.read(&mut out), 12);
        assert_eq!(&out[..12], &data[..]);
        assert_eq!(ring.unread(), 0);
    }

    #[test]
    fn test_frame_larger_than_capacity() {
        let ring = RingBuffer::anonymous(32).unwrap();
        assert_eq!(ring.write(&[0u8; 33]), 0);
        assert_eq!(ring.write(&[]), 0);
    }

    #[test]
    fn test_utilization_tracks_reads() {
        let ring = RingBuffer::anonymous(200).unwrap();
        assert_eq!(ring.utilization(), 0.0);
        ring.write(&[0u8; 150]);
        assert_eq!(ring.utilization(), 75.0);

        let mut out = [0u8; 50];
        ring.read(&mut out);
        assert_eq!(ring.utilization(), 50.0);
        assert_eq!(ring.free_space(), 100);
    }

    #[test]
    fn test_drain_packets() {
        let ring = RingBuffer::anonymous(1024).unwrap();
        ring.write(&frame("a", b"first").unwrap());
        ring.write(&frame("b", b"second").unwrap());

        let packets = ring.drain_packets().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].id, "a");
        assert_eq!(packets[1].payload, b"second");
        assert!(ring.drain_packets().unwrap().is_empty());
    }

    #[test]
    fn test_file_backed_writer_and_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visual.shm");

        let consumer = RingBuffer::create(&path, 4096).unwrap();
        let producer = RingBuffer::open(&path).unwrap();
        assert_eq!(producer.capacity(), 4096);

        producer.write(&frame("t1", b"hello").unwrap());
        let packets = consumer.drain_packets().unwrap();
        assert_eq!(packets[0].payload, b"hello");

        // The producer sees the consumer's read cursor through the map.
        assert_eq!(producer.unread(), 0);

        assert!(!producer.is_detached());
        consumer.mark_detached();
        assert!(producer.is_detached());
    }

    #[test]
    fn test_region_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.shm");
        std::fs::write(&path, [0u8; HEADER_LEN]).unwrap();
        assert!(matches!(
            RingBuffer::open(&path),
            Err(RingError::TooSmall(HEADER_LEN))
        ));
    }

    #[test]
    fn test_open_missing_file() {
        let err = RingBuffer::open(Path::new("/nonexistent/termhost.shm")).unwrap_err();
        assert!(matches!(err, RingError::Open { .. }));
    }
}
