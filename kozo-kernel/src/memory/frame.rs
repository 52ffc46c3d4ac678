//! Physical Frame Allocator
//!
//! A bitmap with one bit per 4 KiB frame, 1 = in-use and 0 = free. The
//! allocator starts with every frame marked in-use and releases only the
//! conventional regions the firmware donates, rounded inward so partial
//! frames are never handed out.
//!
//! Allocation is a linear scan from frame zero: first for a byte that is
//! not `0xFF`, then for a clear bit within it. Freeing clears the bit; no
//! coalescing exists or is needed for a fixed-size allocator.

use kozo_common::memory::PAGE_SIZE;
use kozo_common::{MemoryDescriptor, PhysAddr};
use spin::Mutex;

use super::layout::phys_to_virt;

/// Errors from frame allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAllocError {
    /// No free frame remains.
    OutOfMemory,
    /// The requested frame lies outside the tracked range.
    OutOfBounds,
    /// The allocator has not been initialised.
    NotInitialised,
}

/// Bitmap frame allocator.
///
/// # Invariants
///
/// - `free_frames` equals the number of zero bits in the bitmap
/// - `free_frames + frames_in_use == conventional_frames` at all times,
///   where in-use counts only frames that were ever donated
pub struct FrameAllocator {
    /// One bit per frame; 1 = in-use.
    bitmap: &'static mut [u8],
    /// Number of frames tracked (bits in use within the bitmap).
    total_frames: usize,
    /// Current number of free frames.
    free_frames: usize,
    /// Frames donated by conventional regions (fixed after init).
    conventional_frames: usize,
}

impl FrameAllocator {
    /// Create an allocator over the given bitmap storage with every frame
    /// marked in-use.
    ///
    /// # Safety
    ///
    /// The bitmap memory must remain exclusively owned by this allocator
    /// for its lifetime.
    ///
    /// # Panics
    ///
    /// Panics if the bitmap cannot cover `total_frames` bits.
    pub unsafe fn new(bitmap: &'static mut [u8], total_frames: usize) -> Self {
        assert!(
            bitmap.len() * 8 >= total_frames,
            "bitmap too small: {} bytes for {} frames",
            bitmap.len(),
            total_frames
        );
        for byte in bitmap.iter_mut() {
            *byte = 0xFF;
        }
        Self {
            bitmap,
            total_frames,
            free_frames: 0,
            conventional_frames: 0,
        }
    }

    /// Donate a conventional region, rounding inward to frame boundaries.
    ///
    /// Frames beyond the tracked range are ignored.
    pub fn release_conventional(&mut self, start: PhysAddr, len: u64) {
        let first = start.page_align_up().frame_number();
        let end_addr = start.as_u64().saturating_add(len);
        let last = (PhysAddr::new(end_addr).page_align_down()).frame_number();

        for frame in first..last {
            if frame >= self.total_frames {
                break;
            }
            if self.is_in_use(frame) {
                self.clear_bit(frame);
                self.free_frames += 1;
                self.conventional_frames += 1;
            }
        }
    }

    /// Mark a physical range in-use, rounding outward.
    ///
    /// Used for the bitmap's own frames and firmware structures that lie
    /// within donated regions.
    pub fn reserve(&mut self, start: PhysAddr, len: u64) {
        let first = start.page_align_down().frame_number();
        let end_addr = start.as_u64().saturating_add(len);
        let last = PhysAddr::new(end_addr).page_align_up().frame_number();

        for frame in first..last {
            if frame >= self.total_frames {
                break;
            }
            if !self.is_in_use(frame) {
                self.set_bit(frame);
                self.free_frames -= 1;
            }
        }
    }

    /// Allocate one frame.
    ///
    /// Linear scan from frame zero: the first non-`0xFF` byte, then the
    /// first clear bit within it. The frame contents are stale; use
    /// [`alloc_frame_zeroed`] for anything user-visible.
    #[must_use]
    pub fn alloc(&mut self) -> Option<usize> {
        if self.free_frames == 0 {
            return None;
        }
        let used_bytes = self.total_frames.div_ceil(8);
        for (byte_index, byte) in self.bitmap[..used_bytes].iter_mut().enumerate() {
            if *byte != 0xFF {
                let bit = (!*byte).trailing_zeros() as usize;
                let frame = byte_index * 8 + bit;
                if frame >= self.total_frames {
                    return None;
                }
                *byte |= 1 << bit;
                self.free_frames -= 1;
                return Some(frame);
            }
        }
        None
    }

    /// Return a frame to the pool.
    pub fn free(&mut self, frame: usize) -> Result<(), FrameAllocError> {
        if frame >= self.total_frames {
            return Err(FrameAllocError::OutOfBounds);
        }
        debug_assert!(self.is_in_use(frame), "double free of frame {frame:#x}");
        if self.is_in_use(frame) {
            self.clear_bit(frame);
            self.free_frames += 1;
        }
        Ok(())
    }

    /// Claim a contiguous run of free frames.
    ///
    /// Boot-time helper for carving the initial Untyped donation; the
    /// steady-state interface stays single-frame.
    #[must_use]
    pub fn reserve_contiguous(&mut self, count: usize) -> Option<usize> {
        if count == 0 || self.free_frames < count {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for frame in 0..self.total_frames {
            if self.is_in_use(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set_bit(f);
                }
                self.free_frames -= count;
                return Some(run_start);
            }
        }
        None
    }

    /// Number of free frames.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_frames
    }

    /// Number of frames ever donated by conventional regions.
    #[must_use]
    pub fn conventional_count(&self) -> usize {
        self.conventional_frames
    }

    /// Number of tracked frames.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.total_frames
    }

    #[inline]
    fn is_in_use(&self, frame: usize) -> bool {
        (self.bitmap[frame / 8] >> (frame % 8)) & 1 == 1
    }

    #[inline]
    fn set_bit(&mut self, frame: usize) {
        self.bitmap[frame / 8] |= 1 << (frame % 8);
    }

    #[inline]
    fn clear_bit(&mut self, frame: usize) {
        self.bitmap[frame / 8] &= !(1 << (frame % 8));
    }

    /// Recount free bits and compare with the running counter.
    ///
    /// O(n); debugging aid only.
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) -> bool {
        let mut actual = 0;
        for frame in 0..self.total_frames {
            if !self.is_in_use(frame) {
                actual += 1;
            }
        }
        actual == self.free_frames
    }
}

// -- Global instance

static FRAME_ALLOCATOR: Mutex<Option<FrameAllocator>> = Mutex::new(None);

/// Build the global allocator from the firmware memory map.
///
/// Determines the highest conventional address, places the bitmap in the
/// first donated region large enough to hold it, releases every
/// conventional region, and re-reserves the bitmap's own frames.
///
/// # Safety
///
/// Must be called exactly once, with the direct physical map active and
/// the memory map describing reality.
///
/// # Panics
///
/// Panics if the map contains no conventional region able to hold the
/// bitmap.
pub unsafe fn init<I>(map: I)
where
    I: Iterator<Item = MemoryDescriptor> + Clone,
{
    let mut highest = 0u64;
    for desc in map.clone() {
        if desc.is_conventional() {
            highest = highest.max(desc.end().as_u64());
        }
    }
    assert!(highest > 0, "memory map contains no conventional memory");

    let total_frames = (highest as usize) / PAGE_SIZE;
    let bitmap_bytes = total_frames.div_ceil(8);

    // Place the bitmap at the start of the first donated region that can
    // hold it (rounded inward).
    let mut bitmap_phys = None;
    for desc in map.clone() {
        if !desc.is_conventional() {
            continue;
        }
        let start = desc.start().page_align_up();
        let end = desc.end().page_align_down();
        if end.as_u64() > start.as_u64()
            && (end.as_u64() - start.as_u64()) as usize >= bitmap_bytes
        {
            bitmap_phys = Some(start);
            break;
        }
    }
    let bitmap_phys = bitmap_phys.expect("no conventional region can hold the frame bitmap");

    // SAFETY: The region is conventional memory not yet handed to anyone;
    // the direct map makes it addressable.
    let bitmap = unsafe {
        core::slice::from_raw_parts_mut(phys_to_virt(bitmap_phys).as_mut_ptr::<u8>(), bitmap_bytes)
    };

    // SAFETY: Single initialisation; the bitmap slice is exclusively ours.
    let mut allocator = unsafe { FrameAllocator::new(bitmap, total_frames) };

    for desc in map {
        if desc.is_conventional() {
            allocator.release_conventional(desc.start(), desc.byte_len());
        }
    }

    allocator.reserve(bitmap_phys, bitmap_bytes as u64);

    log::info!(
        "frame allocator: {} MiB free of {} MiB conventional, bitmap at {}",
        allocator.free_count() * PAGE_SIZE / (1024 * 1024),
        allocator.conventional_count() * PAGE_SIZE / (1024 * 1024),
        bitmap_phys,
    );

    *FRAME_ALLOCATOR.lock() = Some(allocator);
}

/// Allocate a physical frame. Contents are stale.
#[must_use]
pub fn alloc_frame() -> Option<PhysAddr> {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .and_then(FrameAllocator::alloc)
        .map(|frame| PhysAddr::new((frame * PAGE_SIZE) as u64))
}

/// Allocate a physical frame and zero it through the direct map.
///
/// This is the variant for anything that crosses the user boundary: page
/// tables, retyped objects, user mappings.
#[must_use]
pub fn alloc_frame_zeroed() -> Option<PhysAddr> {
    let phys = alloc_frame()?;
    // SAFETY: The frame was just allocated, so nothing else references it.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(phys).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }
    Some(phys)
}

/// Return a frame to the pool.
pub fn free_frame(phys: PhysAddr) {
    let mut guard = FRAME_ALLOCATOR.lock();
    if let Some(alloc) = guard.as_mut() {
        if let Err(e) = alloc.free(phys.frame_number()) {
            log::warn!("free_frame({phys}): {e:?}");
        }
    }
}

/// Carve a contiguous physical region out of the allocator (boot only).
#[must_use]
pub fn reserve_contiguous(bytes: u64) -> Option<PhysAddr> {
    let count = (bytes as usize).div_ceil(PAGE_SIZE);
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .and_then(|a| a.reserve_contiguous(count))
        .map(|frame| PhysAddr::new((frame * PAGE_SIZE) as u64))
}

/// Mark a physical range in-use (firmware structures, initrd).
pub fn reserve_range(start: PhysAddr, len: u64) {
    let mut guard = FRAME_ALLOCATOR.lock();
    if let Some(alloc) = guard.as_mut() {
        alloc.reserve(start, len);
    }
}

/// `(free_frames, conventional_frames)` for diagnostics and accounting.
#[must_use]
pub fn stats() -> (usize, usize) {
    let guard = FRAME_ALLOCATOR.lock();
    guard
        .as_ref()
        .map(|a| (a.free_count(), a.conventional_count()))
        .unwrap_or((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_allocator(frames: usize) -> FrameAllocator {
        let bitmap = Box::leak(vec![0u8; frames.div_ceil(8)].into_boxed_slice());
        // SAFETY: leaked storage is exclusively ours.
        unsafe { FrameAllocator::new(bitmap, frames) }
    }

    #[test]
    fn test_starts_fully_reserved() {
        let alloc = new_allocator(64);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn test_release_and_alloc_lowest_first() {
        let mut alloc = new_allocator(64);
        alloc.release_conventional(PhysAddr::new(0x4000), 4 * PAGE_SIZE as u64);
        assert_eq!(alloc.free_count(), 4);

        assert_eq!(alloc.alloc(), Some(4));
        assert_eq!(alloc.alloc(), Some(5));
        alloc.free(4).unwrap();
        // Freed frame is found again before higher ones.
        assert_eq!(alloc.alloc(), Some(4));
    }

    #[test]
    fn test_inward_rounding() {
        let mut alloc = new_allocator(64);
        // 0x1800..0x3800 contains exactly one whole frame: frame 2.
        alloc.release_conventional(PhysAddr::new(0x1800), 0x2000);
        assert_eq!(alloc.free_count(), 1);
        assert_eq!(alloc.alloc(), Some(2));
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = new_allocator(16);
        alloc.release_conventional(PhysAddr::new(0), 2 * PAGE_SIZE as u64);
        assert!(alloc.alloc().is_some());
        assert!(alloc.alloc().is_some());
        assert_eq!(alloc.alloc(), None);
    }

    #[test]
    fn test_conservation_invariant() {
        let mut alloc = new_allocator(128);
        alloc.release_conventional(PhysAddr::new(0), 100 * PAGE_SIZE as u64);
        let conventional = alloc.conventional_count();

        let mut held = Vec::new();
        for _ in 0..37 {
            held.push(alloc.alloc().unwrap());
        }
        let freed: Vec<usize> = held.iter().copied().step_by(2).collect();
        for f in &freed {
            alloc.free(*f).unwrap();
        }

        // free + in-use == conventional at every point.
        let in_use = held.len() - freed.len();
        assert_eq!(alloc.free_count() + in_use, conventional);
        assert!(alloc.verify_invariants());
    }

    #[test]
    fn test_reserve_outward() {
        let mut alloc = new_allocator(64);
        alloc.release_conventional(PhysAddr::new(0), 8 * PAGE_SIZE as u64);
        // Reserving a sliver of frame 3 takes the whole frame.
        alloc.reserve(PhysAddr::new(0x3800), 0x100);
        let mut got = Vec::new();
        while let Some(f) = alloc.alloc() {
            got.push(f);
        }
        assert!(!got.contains(&3));
    }

    #[test]
    fn test_beyond_range_ignored() {
        let mut alloc = new_allocator(8);
        // Region extends past the tracked range; the excess is ignored.
        alloc.release_conventional(PhysAddr::new(0), 64 * PAGE_SIZE as u64);
        assert_eq!(alloc.free_count(), 8);
    }
}
