//! Domain handle: `setup`/`connect`/`free`/`barrier`/`write`/`read`/
//! `shutdown`/`terminating` (spec §4.D).

use std::fs::OpenOptions;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::{addr_of_mut, NonNull};
use std::sync::atomic::Ordering;

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::debug;

use crate::shm::header::{BufferHeader, Header, RegionLayout};
use crate::shm::mutex::{self, MutexGuard, SignalMask};
use crate::shm::{condvar, ring};

#[derive(Debug)]
pub enum ShmError {
    Io(io::Error),
    Nix(nix::Error),
    /// A raw pthread/platform error code, surfaced as-is (spec §7 kind 5).
    Platform(libc::c_int),
    RankOutOfRange,
    ZeroLengthBuffer,
    NotCreator,
    /// `connect` was attempted before `setup` fully initialized the header.
    Uninitialized,
}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShmError::Io(e) => write!(f, "shared-domain I/O error: {e}"),
            ShmError::Nix(e) => write!(f, "shared-domain platform error: {e}"),
            ShmError::Platform(code) => write!(f, "shared-domain pthread error (errno {code})"),
            ShmError::RankOutOfRange => write!(f, "rank out of range"),
            ShmError::ZeroLengthBuffer => write!(f, "zero-length buffer"),
            ShmError::NotCreator => write!(f, "only the creator may perform this operation"),
            ShmError::Uninitialized => write!(f, "shared domain header is not initialized"),
        }
    }
}

impl std::error::Error for ShmError {}

impl From<io::Error> for ShmError {
    fn from(e: io::Error) -> Self {
        ShmError::Io(e)
    }
}

impl From<nix::Error> for ShmError {
    fn from(e: nix::Error) -> Self {
        ShmError::Nix(e)
    }
}

/// One participant's view of the communication domain (spec §3(E), "Domain
/// handle"). Not itself shared; everything reachable through `base` is.
pub struct DomainHandle {
    creator: bool,
    rank: u32,
    participant_count: u32,
    buffer_capacity: u32,
    path: PathBuf,
    base: NonNull<u8>,
    mapping_size: usize,
    layout: RegionLayout,
    extra_size: usize,
    mask: Option<SignalMask>,
}

unsafe impl Send for DomainHandle {}

impl DomainHandle {
    /// Create the backing file, size it for `participant_count` mailboxes
    /// of `buffer_capacity` bytes plus `extra_size` bytes of passthrough
    /// space, map it, and initialize every process-shared primitive in it.
    /// Only the creator calls this (spec §4.D).
    pub fn setup(
        buffer_capacity: u32,
        participant_count: u32,
        extra_size: usize,
        mask: Option<SignalMask>,
    ) -> Result<Self, ShmError> {
        let layout = RegionLayout::compute(
            participant_count as usize,
            buffer_capacity as usize,
            extra_size,
        );

        let named = tempfile::Builder::new()
            .prefix("posix-sessions-shm-")
            .tempfile()?;
        let (file, path) = named.keep().map_err(|e| ShmError::Io(e.error))?;
        file.set_len(layout.total_size as u64)?;

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(layout.total_size).ok_or(ShmError::ZeroLengthBuffer)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        }
        .cast::<u8>();
        drop(file);

        unsafe {
            std::ptr::write_bytes(base.as_ptr(), 0, layout.total_size);

            let header = base.as_ptr().cast::<Header>();
            (*header).participant_count = participant_count;
            (*header).buffer_capacity = buffer_capacity;
            (*header).extra_size = extra_size;
            (*header).extra_offset = layout.extra_offset;
            mutex::init(addr_of_mut!((*header).mutex))?;
            condvar::init(addr_of_mut!((*header).wait_for_barrier))?;

            for rank in 0..participant_count {
                let bh = base
                    .as_ptr()
                    .add(layout.buffers_offset + rank as usize * layout.stride)
                    .cast::<BufferHeader>();
                mutex::init(addr_of_mut!((*bh).mutex))?;
                condvar::init(addr_of_mut!((*bh).ready_for_reading))?;
                condvar::init(addr_of_mut!((*bh).ready_for_writing))?;
                condvar::init(addr_of_mut!((*bh).ready_for_writing_alone))?;
                condvar::init(addr_of_mut!((*bh).ready_for_reading_alone))?;
            }
        }

        debug!(
            path = %path.display(),
            participant_count,
            buffer_capacity,
            "shared domain created"
        );

        Ok(DomainHandle {
            creator: true,
            rank: 0,
            participant_count,
            buffer_capacity,
            path,
            base,
            mapping_size: layout.total_size,
            layout,
            extra_size,
            mask,
        })
    }

    /// Open an existing domain by its backing file path, learning `N`, `B`,
    /// and the extra-space size from the header (spec §4.D).
    pub fn connect(path: &Path, rank: u32, mask: Option<SignalMask>) -> Result<Self, ShmError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let probe_len = std::mem::size_of::<Header>();
        if (file.metadata()?.len() as usize) < probe_len {
            return Err(ShmError::Uninitialized);
        }

        let probe = unsafe {
            mmap(
                None,
                NonZeroUsize::new(probe_len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };

        let (participant_count, buffer_capacity, extra_size) = unsafe {
            let header = probe.as_ptr().cast::<Header>();
            let result = (
                (*header).participant_count,
                (*header).buffer_capacity,
                (*header).extra_size,
            );
            munmap(probe, probe_len)?;
            result
        };

        if participant_count == 0 {
            return Err(ShmError::Uninitialized);
        }
        if rank >= participant_count {
            return Err(ShmError::RankOutOfRange);
        }

        let layout = RegionLayout::compute(
            participant_count as usize,
            buffer_capacity as usize,
            extra_size,
        );

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(layout.total_size).ok_or(ShmError::ZeroLengthBuffer)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        }
        .cast::<u8>();

        debug!(path = %path.display(), rank, "joined shared domain");

        Ok(DomainHandle {
            creator: false,
            rank,
            participant_count,
            buffer_capacity,
            path: path.to_path_buf(),
            base,
            mapping_size: layout.total_size,
            layout,
            extra_size,
            mask,
        })
    }

    /// The creator destroys every mutex/condvar and unlinks the backing
    /// file; non-creators just unmap (which `Drop` performs regardless).
    pub fn free(self) -> Result<(), ShmError> {
        if self.creator {
            unsafe {
                mutex::destroy(addr_of_mut!((*self.header()).mutex));
                condvar::destroy(addr_of_mut!((*self.header()).wait_for_barrier));
                for rank in 0..self.participant_count {
                    let bh = self.buffer_header(rank);
                    mutex::destroy(addr_of_mut!((*bh).mutex));
                    condvar::destroy(addr_of_mut!((*bh).ready_for_reading));
                    condvar::destroy(addr_of_mut!((*bh).ready_for_writing));
                    condvar::destroy(addr_of_mut!((*bh).ready_for_writing_alone));
                    condvar::destroy(addr_of_mut!((*bh).ready_for_reading_alone));
                }
            }
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn participant_count(&self) -> u32 {
        self.participant_count
    }

    pub fn terminating(&self) -> bool {
        unsafe { (*self.header()).terminating.load(Ordering::SeqCst) != 0 }
    }

    /// Creator-only: wakes every blocked participant in the domain and
    /// marks it terminating so future calls fail fast (spec §4.D).
    pub fn shutdown(&mut self) -> Result<(), ShmError> {
        if !self.creator {
            return Err(ShmError::NotCreator);
        }

        unsafe {
            (*self.header()).terminating.store(1, Ordering::SeqCst);

            let guard = mutex::lock(addr_of_mut!((*self.header()).mutex), self.mask.as_ref())?;
            condvar::broadcast(addr_of_mut!((*self.header()).wait_for_barrier));
            drop(guard);

            for rank in 0..self.participant_count {
                let bh = self.buffer_header(rank);
                let guard = mutex::lock(addr_of_mut!((*bh).mutex), self.mask.as_ref())?;
                condvar::broadcast(addr_of_mut!((*bh).ready_for_reading));
                condvar::broadcast(addr_of_mut!((*bh).ready_for_writing));
                condvar::broadcast(addr_of_mut!((*bh).ready_for_writing_alone));
                condvar::broadcast(addr_of_mut!((*bh).ready_for_reading_alone));
                drop(guard);
            }
        }

        debug!("shared domain shutdown broadcast");
        Ok(())
    }

    /// All-participant rendezvous (spec §4.D "Barrier protocol"). Returns
    /// `false` immediately if the domain is or becomes terminating.
    pub fn barrier(&mut self) -> Result<bool, ShmError> {
        if self.terminating() {
            return Ok(false);
        }

        unsafe {
            let header = self.header();
            let guard = mutex::lock(addr_of_mut!((*header).mutex), self.mask.as_ref())?;
            if self.terminating() {
                return Ok(false);
            }

            if (*header).sync_count == 0 {
                (*header).sync_count = self.participant_count - 1;
            } else {
                (*header).sync_count -= 1;
            }

            if (*header).sync_count == 0 {
                condvar::broadcast(addr_of_mut!((*header).wait_for_barrier));
                return Ok(true);
            }

            loop {
                condvar::wait(addr_of_mut!((*header).wait_for_barrier), &guard)?;
                if self.terminating() {
                    return Ok(false);
                }
                if (*header).sync_count == 0 {
                    return Ok(true);
                }
            }
        }
    }

    /// Atomic multi-byte send to `recipient`'s mailbox (spec §4.D "Ring
    /// semantics"). Blocks while another sender holds the token, then while
    /// the ring is full, transferring across as many wraps as needed.
    pub fn write(&mut self, recipient: u32, buf: &[u8]) -> Result<bool, ShmError> {
        if recipient >= self.participant_count {
            return Err(ShmError::RankOutOfRange);
        }
        if buf.is_empty() {
            return Err(ShmError::ZeroLengthBuffer);
        }
        if self.terminating() {
            return Ok(false);
        }

        let capacity = self.buffer_capacity as usize;
        unsafe {
            let bh = self.buffer_header(recipient);
            let ring = self.ring_ptr(recipient);

            let guard = mutex::lock(addr_of_mut!((*bh).mutex), self.mask.as_ref())?;
            if self.terminating() {
                return Ok(false);
            }

            while (*bh).writing {
                condvar::wait(addr_of_mut!((*bh).ready_for_writing_alone), &guard)?;
                if self.terminating() {
                    return Ok(false);
                }
            }
            (*bh).writing = true;

            let mut sent = 0usize;
            let mut outcome = Ok(true);
            'xfer: loop {
                if sent == buf.len() {
                    break 'xfer;
                }
                if self.terminating() {
                    outcome = Ok(false);
                    break 'xfer;
                }
                while (*bh).filled == capacity {
                    if self.terminating() {
                        outcome = Ok(false);
                        break 'xfer;
                    }
                    if let Err(e) = condvar::wait(addr_of_mut!((*bh).ready_for_writing), &guard) {
                        outcome = Err(e);
                        break 'xfer;
                    }
                }
                let n = ring::write_run(bh, ring, capacity, &buf[sent..]);
                if n == 0 {
                    continue;
                }
                sent += n;
                condvar::signal(addr_of_mut!((*bh).ready_for_reading));
            }

            (*bh).writing = false;
            condvar::signal(addr_of_mut!((*bh).ready_for_writing_alone));
            outcome
        }
    }

    /// Atomic multi-byte receive from this participant's own mailbox (spec
    /// §4.D). Blocks while another thread in this process holds the
    /// reading token, then while the ring is empty.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ShmError> {
        if buf.is_empty() {
            return Err(ShmError::ZeroLengthBuffer);
        }
        if self.terminating() {
            return Ok(0);
        }

        let rank = self.rank;
        let capacity = self.buffer_capacity as usize;
        unsafe {
            let bh = self.buffer_header(rank);
            let ring = self.ring_ptr(rank);

            let guard = mutex::lock(addr_of_mut!((*bh).mutex), self.mask.as_ref())?;
            if self.terminating() {
                return Ok(0);
            }

            while (*bh).reading {
                condvar::wait(addr_of_mut!((*bh).ready_for_reading_alone), &guard)?;
                if self.terminating() {
                    return Ok(0);
                }
            }
            (*bh).reading = true;

            let mut received = 0usize;
            let mut outcome = Ok(0usize);
            'xfer: loop {
                if received == buf.len() {
                    outcome = Ok(received);
                    break 'xfer;
                }
                if self.terminating() {
                    outcome = Ok(0);
                    break 'xfer;
                }
                while (*bh).filled == 0 {
                    if self.terminating() {
                        outcome = Ok(0);
                        break 'xfer;
                    }
                    if let Err(e) = condvar::wait(addr_of_mut!((*bh).ready_for_reading), &guard) {
                        outcome = Err(e);
                        break 'xfer;
                    }
                }
                let n = ring::read_run(bh, ring, capacity, &mut buf[received..]);
                if n == 0 {
                    continue;
                }
                received += n;
                condvar::signal(addr_of_mut!((*bh).ready_for_writing));
            }

            (*bh).reading = false;
            condvar::signal(addr_of_mut!((*bh).ready_for_reading_alone));
            outcome
        }
    }

    /// The participant-defined passthrough region above the header
    /// (spec §3(E): "the shared-domain-adjacent data types are not
    /// required" of the byte-buffer collaborator).
    pub fn extra(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(self.layout.extra_offset), self.extra_size) }
    }

    pub fn extra_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(self.layout.extra_offset), self.extra_size)
        }
    }

    fn header(&self) -> *mut Header {
        self.base.as_ptr().cast()
    }

    fn buffer_header(&self, rank: u32) -> *mut BufferHeader {
        unsafe {
            self.base
                .as_ptr()
                .add(self.layout.buffers_offset + rank as usize * self.layout.stride)
                .cast()
        }
    }

    fn ring_ptr(&self, rank: u32) -> *mut u8 {
        unsafe {
            self.base.as_ptr().add(
                self.layout.buffers_offset
                    + rank as usize * self.layout.stride
                    + std::mem::size_of::<BufferHeader>(),
            )
        }
    }
}

impl Drop for DomainHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.cast(), self.mapping_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_connect_write_read_roundtrip() {
        let mut creator = DomainHandle::setup(4096, 2, 0, None).expect("setup");
        let path = creator.path.clone();

        let mut joiner = DomainHandle::connect(&path, 1, None).expect("connect");
        assert_eq!(joiner.participant_count(), 2);
        assert_eq!(joiner.rank(), 1);

        assert!(creator.write(1, b"hello").expect("write"));
        let mut out = [0u8; 5];
        let n = joiner.read(&mut out).expect("read");
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");

        creator.free().expect("free");
    }

    #[test]
    fn barrier_round_trips_for_single_participant() {
        let mut creator = DomainHandle::setup(1024, 1, 0, None).expect("setup");
        assert!(creator.barrier().expect("barrier"));
        assert!(creator.barrier().expect("second barrier"));
        creator.free().expect("free");
    }

    #[test]
    fn shutdown_marks_terminating_and_fails_new_calls() {
        let mut creator = DomainHandle::setup(1024, 2, 0, None).expect("setup");
        creator.shutdown().expect("shutdown");
        assert!(creator.terminating());
        assert_eq!(creator.write(1, b"x").expect("write returns false"), false);
        creator.free().expect("free");
    }

    #[test]
    fn rank_out_of_range_is_rejected() {
        let mut creator = DomainHandle::setup(1024, 2, 0, None).expect("setup");
        assert!(matches!(creator.write(5, b"x"), Err(ShmError::RankOutOfRange)));
        creator.free().expect("free");
    }
}
