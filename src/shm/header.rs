//! Layout of the shared mapping: domain-wide header, per-recipient mailbox
//! header, and the stride/offset arithmetic that ties them together (spec
//! §3(E), §6 "Shared-domain backing file").

use std::sync::atomic::AtomicU32;

use libc::{pthread_cond_t, pthread_mutex_t};

pub(crate) const ALIGN: usize = 64;

pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Domain-wide state: participant count, ring capacity, the barrier's own
/// mutex/condvar/counter, the extra-space descriptor, and the terminating
/// flag (spec §3(E)). `terminating` is a plain atomic so it can be checked
/// without taking any mutex (spec §4.D "Shutdown": checked before the lock,
/// after it, and after every wait).
#[repr(C)]
pub(crate) struct Header {
    pub participant_count: u32,
    pub buffer_capacity: u32,
    pub mutex: pthread_mutex_t,
    pub wait_for_barrier: pthread_cond_t,
    pub sync_count: u32,
    pub extra_size: usize,
    pub extra_offset: usize,
    pub terminating: AtomicU32,
}

/// One recipient's mailbox: its mutex, its four condition variables, the
/// writing/reading exclusivity tokens, and the ring cursors. The ring's
/// byte storage follows this struct in memory (spec §3(E)).
#[repr(C)]
pub(crate) struct BufferHeader {
    pub mutex: pthread_mutex_t,
    pub ready_for_reading: pthread_cond_t,
    pub ready_for_writing: pthread_cond_t,
    pub ready_for_writing_alone: pthread_cond_t,
    pub ready_for_reading_alone: pthread_cond_t,
    pub writing: bool,
    pub reading: bool,
    pub filled: usize,
    pub read_index: usize,
    pub write_index: usize,
}

/// Computed once from `(N, B, extra_size)` at `setup`/`connect` time; never
/// stored in the shared region itself (spec §6: "stride and offsets are
/// computed once from B and N").
pub(crate) struct RegionLayout {
    pub stride: usize,
    pub buffers_offset: usize,
    pub extra_offset: usize,
    pub total_size: usize,
}

impl RegionLayout {
    pub(crate) fn compute(participant_count: usize, buffer_capacity: usize, extra_size: usize) -> Self {
        let header_size = align_up(std::mem::size_of::<Header>(), ALIGN);
        let stride = align_up(std::mem::size_of::<BufferHeader>() + buffer_capacity, ALIGN);
        let buffers_offset = header_size;
        let extra_offset = align_up(buffers_offset + participant_count * stride, ALIGN);
        let total_size = extra_offset + align_up(extra_size, ALIGN);
        RegionLayout {
            stride,
            buffers_offset,
            extra_offset,
            total_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stride_aligned_and_monotonic() {
        let layout = RegionLayout::compute(4, 4096, 128);
        assert_eq!(layout.stride % ALIGN, 0);
        assert_eq!(layout.buffers_offset % ALIGN, 0);
        assert_eq!(layout.extra_offset % ALIGN, 0);
        assert!(layout.total_size >= layout.extra_offset + 128);
        assert!(layout.buffers_offset + 4 * layout.stride <= layout.extra_offset);
    }

    #[test]
    fn layout_with_no_extra_space_is_still_valid() {
        let layout = RegionLayout::compute(2, 256, 0);
        assert!(layout.total_size >= layout.extra_offset);
    }
}
