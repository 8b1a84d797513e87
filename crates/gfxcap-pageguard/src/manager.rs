use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

#[cfg(unix)]
use crate::trap;

/// Fallback shadow alignment for targets where the page size is unknown.
#[cfg(not(unix))]
const SHADOW_ALIGN: usize = 4096;

/// Process-wide dirty tracker for mapped allocations.
///
/// Created by the capture manager at initialization when page-guard tracking
/// is selected and destroyed with it. Flush callbacks receive
/// `(memory_id, base, offset, size)` where `base` is the pointer whose bytes
/// are current from the application's point of view (the shadow buffer when
/// shadowing is active, the real mapping otherwise) and `offset`/`size`
/// delimit one contiguous dirty run relative to the start of the mapping.
pub struct PageGuardManager {
    entries: Mutex<HashMap<u64, MemoryEntry>>,
}

// SAFETY: the raw pointers held by the entry table refer to driver- or
// shadow-owned mappings that the add/remove contract keeps alive while they
// are tracked. All access to the table is serialized by the entries mutex.
unsafe impl Send for PageGuardManager {}
unsafe impl Sync for PageGuardManager {}

struct InstanceSlot {
    manager: Arc<PageGuardManager>,
    refcount: u32,
}

static INSTANCE: Mutex<Option<InstanceSlot>> = Mutex::new(None);

impl PageGuardManager {
    /// Creates (or re-references) the process-wide manager.
    pub fn create() -> Arc<Self> {
        let mut slot = INSTANCE.lock().unwrap();
        match slot.as_mut() {
            Some(existing) => {
                existing.refcount += 1;
                existing.manager.clone()
            }
            None => {
                let manager = Arc::new(Self {
                    entries: Mutex::new(HashMap::new()),
                });
                *slot = Some(InstanceSlot {
                    manager: manager.clone(),
                    refcount: 1,
                });
                manager
            }
        }
    }

    pub fn get() -> Option<Arc<Self>> {
        INSTANCE.lock().unwrap().as_ref().map(|s| s.manager.clone())
    }

    /// Drops one reference; the last one releases all tracked regions.
    pub fn destroy() {
        let mut slot = INSTANCE.lock().unwrap();
        let released = match slot.as_mut() {
            Some(existing) => {
                existing.refcount -= 1;
                (existing.refcount == 0).then(|| existing.manager.clone())
            }
            None => None,
        };
        if let Some(manager) = released {
            *slot = None;
            drop(slot);
            manager.clear();
        }
    }

    /// Starts tracking `size` bytes at `ptr` under `memory_id` and returns the
    /// pointer the application should write through. With `use_shadow` the
    /// returned pointer is a page-aligned shadow copy; otherwise it is `ptr`
    /// and the application's pages are guarded in place.
    pub fn add_memory(&self, memory_id: u64, ptr: *mut u8, size: usize, use_shadow: bool) -> *mut u8 {
        if ptr.is_null() || size == 0 {
            warn!(memory_id, size, "refusing to track an empty mapping");
            return ptr;
        }

        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&memory_id) {
            warn!(memory_id, "memory is already tracked");
            return existing.guard_base() as *mut u8;
        }

        let entry = MemoryEntry::new(memory_id, ptr, size, use_shadow);
        let guard = entry.guard_base() as *mut u8;
        entries.insert(memory_id, entry);
        guard
    }

    /// Flushes one tracked region through `handler`.
    pub fn process_memory_entry(
        &self,
        memory_id: u64,
        mut handler: impl FnMut(u64, *const u8, usize, usize),
    ) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&memory_id) {
            Some(entry) => entry.flush(&mut handler),
            None => warn!(memory_id, "flush requested for untracked memory"),
        }
    }

    /// Flushes every tracked region through `handler`.
    pub fn process_memory_entries(&self, mut handler: impl FnMut(u64, *const u8, usize, usize)) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            entry.flush(&mut handler);
        }
    }

    /// Stops tracking `memory_id`, restoring page protections and syncing any
    /// remaining shadow contents back into the real mapping.
    pub fn remove_memory(&self, memory_id: u64) {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(&memory_id) {
            Some(entry) => entry.release(),
            None => warn!(memory_id, "remove requested for untracked memory"),
        }
    }

    pub fn is_tracked(&self, memory_id: u64) -> bool {
        self.entries.lock().unwrap().contains_key(&memory_id)
    }

    fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            entry.release();
        }
    }
}

enum Tracking {
    /// Pages are write-protected; the fault handler records dirty pages.
    #[cfg(unix)]
    Guarded {
        handle: trap::RegionHandle,
        prot_start: usize,
        prot_len: usize,
        /// Bytes between the guarded span start and the mapping start
        /// (nonzero only when guarding an unaligned mapping in place).
        lead: usize,
    },
    /// No protection available; every flush reports the whole region.
    FullRefresh,
}

struct MemoryEntry {
    memory_id: u64,
    real_ptr: *mut u8,
    size: usize,
    shadow: Option<ShadowMemory>,
    tracking: Tracking,
}

impl MemoryEntry {
    #[cfg(unix)]
    fn new(memory_id: u64, ptr: *mut u8, size: usize, use_shadow: bool) -> Self {
        let page_size = trap::page_size();

        let (shadow, prot_start, prot_len, lead) = if use_shadow {
            match ShadowMemory::allocate(size, page_size) {
                Some(shadow) => {
                    // Seed the shadow with the current mapping contents so
                    // reads through the returned pointer observe them.
                    unsafe { std::ptr::copy_nonoverlapping(ptr, shadow.ptr, size) };
                    let start = shadow.ptr as usize;
                    let len = shadow.layout.size();
                    (Some(shadow), start, len, 0)
                }
                None => {
                    warn!(memory_id, size, "shadow allocation failed; falling back to full refresh");
                    return Self {
                        memory_id,
                        real_ptr: ptr,
                        size,
                        shadow: None,
                        tracking: Tracking::FullRefresh,
                    };
                }
            }
        } else {
            let start = (ptr as usize) & !(page_size - 1);
            let end = (ptr as usize + size).div_ceil(page_size) * page_size;
            (None, start, end - start, ptr as usize - start)
        };

        let tracking = match trap::register_region(prot_start, prot_len) {
            Some(handle) => {
                if unsafe { trap::protect_readonly(prot_start as *mut u8, prot_len) } {
                    Tracking::Guarded {
                        handle,
                        prot_start,
                        prot_len,
                        lead,
                    }
                } else {
                    warn!(memory_id, "mprotect failed; falling back to full refresh");
                    trap::unregister_region(&handle);
                    Tracking::FullRefresh
                }
            }
            None => {
                warn!(memory_id, "no free guard slots; falling back to full refresh");
                Tracking::FullRefresh
            }
        };

        Self {
            memory_id,
            real_ptr: ptr,
            size,
            shadow,
            tracking,
        }
    }

    #[cfg(not(unix))]
    fn new(memory_id: u64, ptr: *mut u8, size: usize, use_shadow: bool) -> Self {
        let shadow = if use_shadow {
            ShadowMemory::allocate(size, SHADOW_ALIGN).map(|shadow| {
                unsafe { std::ptr::copy_nonoverlapping(ptr, shadow.ptr, size) };
                shadow
            })
        } else {
            None
        };
        Self {
            memory_id,
            real_ptr: ptr,
            size,
            shadow,
            tracking: Tracking::FullRefresh,
        }
    }

    fn guard_base(&self) -> *const u8 {
        match &self.shadow {
            Some(shadow) => shadow.ptr as *const u8,
            None => self.real_ptr as *const u8,
        }
    }

    fn flush(&mut self, handler: &mut dyn FnMut(u64, *const u8, usize, usize)) {
        match &self.tracking {
            #[cfg(unix)]
            Tracking::Guarded {
                handle,
                prot_start,
                lead,
                ..
            } => {
                let page_size = trap::page_size();
                let mut words = Vec::new();
                trap::take_dirty_words(handle, &mut words);
                let runs = dirty_runs(&words, handle.pages());
                if runs.is_empty() {
                    return;
                }

                // Re-arm before reading: a write racing with the walk faults
                // again and is re-reported by the next flush.
                for (first_page, count) in &runs {
                    unsafe {
                        trap::protect_readonly(
                            (prot_start + first_page * page_size) as *mut u8,
                            count * page_size,
                        );
                    }
                }

                let region_start = prot_start + lead;
                let source = self.guard_base();
                for (first_page, count) in runs {
                    let span_start = prot_start + first_page * page_size;
                    let span_end = span_start + count * page_size;
                    let Some((offset, len)) =
                        clamp_span(span_start, span_end, region_start, self.size)
                    else {
                        continue;
                    };
                    handler(self.memory_id, source, offset, len);
                    if let Some(shadow) = &self.shadow {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                shadow.ptr.add(offset),
                                self.real_ptr.add(offset),
                                len,
                            );
                        }
                    }
                }
            }
            Tracking::FullRefresh => {
                handler(self.memory_id, self.guard_base(), 0, self.size);
                if let Some(shadow) = &self.shadow {
                    unsafe {
                        std::ptr::copy_nonoverlapping(shadow.ptr, self.real_ptr, self.size)
                    };
                }
            }
        }
    }

    fn release(self) {
        #[cfg(unix)]
        if let Tracking::Guarded {
            handle,
            prot_start,
            prot_len,
            ..
        } = &self.tracking
        {
            // Unprotect before dropping the slot: a write racing with the
            // removal must still find the region registered while it can
            // fault.
            unsafe { trap::protect_readwrite(*prot_start as *mut u8, *prot_len) };
            trap::unregister_region(handle);
        }
        // Writes still sitting in the shadow must reach the driver's memory
        // even without a final flush.
        if let Some(shadow) = &self.shadow {
            unsafe { std::ptr::copy_nonoverlapping(shadow.ptr, self.real_ptr, self.size) };
        }
    }
}

struct ShadowMemory {
    ptr: *mut u8,
    layout: Layout,
}

impl ShadowMemory {
    fn allocate(size: usize, align: usize) -> Option<Self> {
        let rounded = size.checked_add(align - 1)? & !(align - 1);
        let layout = Layout::from_size_align(rounded, align).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(Self { ptr, layout })
        }
    }
}

impl Drop for ShadowMemory {
    fn drop(&mut self) {
        unsafe {
            // The allocation may still be write-protected; the allocator must
            // get it back writable.
            #[cfg(unix)]
            crate::trap::protect_readwrite(self.ptr, self.layout.size());
            std::alloc::dealloc(self.ptr, self.layout);
        }
    }
}

/// Intersects a dirty page span with the tracked byte region, returning the
/// run as `(offset, len)` relative to the region start.
fn clamp_span(
    span_start: usize,
    span_end: usize,
    region_start: usize,
    region_len: usize,
) -> Option<(usize, usize)> {
    let region_end = region_start + region_len;
    let begin = span_start.max(region_start);
    let end = span_end.min(region_end);
    if begin >= end {
        return None;
    }
    Some((begin - region_start, end - begin))
}

/// Collapses a dirty bitmap into `(first_page, page_count)` runs.
fn dirty_runs(words: &[u64], pages: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut run_start = None;
    for page in 0..pages {
        let dirty = words
            .get(page / 64)
            .is_some_and(|word| word & (1 << (page % 64)) != 0);
        match (dirty, run_start) {
            (true, None) => run_start = Some(page),
            (false, Some(start)) => {
                runs.push((start, page - start));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        runs.push((start, pages - start));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_runs_coalesces_adjacent_pages() {
        // pages 0,1 dirty; 3 dirty; 5..8 dirty
        let words = [0b1110_1011u64];
        assert_eq!(dirty_runs(&words, 8), vec![(0, 2), (3, 1), (5, 3)]);
    }

    #[test]
    fn dirty_runs_crosses_word_boundaries() {
        let words = [1u64 << 63, 0b11];
        assert_eq!(dirty_runs(&words, 66), vec![(63, 3)]);
    }

    #[test]
    fn dirty_runs_ignores_bits_past_page_count() {
        let words = [u64::MAX];
        assert_eq!(dirty_runs(&words, 3), vec![(0, 3)]);
    }

    #[test]
    fn clamp_span_trims_partial_boundary_pages() {
        // Region of 100 bytes starting 24 bytes into the first page.
        assert_eq!(clamp_span(0, 4096, 24, 100), Some((0, 100)));
        // Span beginning after the region ends.
        assert_eq!(clamp_span(4096, 8192, 24, 100), None);
        // Span covering only the tail of the region.
        assert_eq!(clamp_span(4096, 8192, 4000, 1000), Some((96, 904)));
    }

    #[test]
    fn full_refresh_reports_whole_region() {
        let mut backing = vec![7u8; 256];
        let mut entry = MemoryEntry {
            memory_id: 42,
            real_ptr: backing.as_mut_ptr(),
            size: backing.len(),
            shadow: None,
            tracking: Tracking::FullRefresh,
        };

        let mut seen = Vec::new();
        entry.flush(&mut |id, base, offset, size| {
            let bytes = unsafe { std::slice::from_raw_parts(base.add(offset), size) };
            seen.push((id, offset, bytes.to_vec()));
        });

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 42);
        assert_eq!(seen[0].1, 0);
        assert_eq!(seen[0].2, vec![7u8; 256]);
    }

    #[test]
    fn full_refresh_shadow_syncs_back() {
        let mut backing = vec![0u8; 64];
        let shadow = ShadowMemory::allocate(64, 64).expect("shadow allocation");
        unsafe { std::ptr::copy_nonoverlapping(backing.as_ptr(), shadow.ptr, 64) };
        unsafe { shadow.ptr.add(3).write(0xAA) };

        let mut entry = MemoryEntry {
            memory_id: 1,
            real_ptr: backing.as_mut_ptr(),
            size: backing.len(),
            shadow: Some(shadow),
            tracking: Tracking::FullRefresh,
        };

        entry.flush(&mut |_, _, _, _| {});
        assert_eq!(backing[3], 0xAA, "flush must copy shadow writes back");
    }
}
