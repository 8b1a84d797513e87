//! SIGSEGV-driven dirty-page marking.
//!
//! The fault handler runs in signal context, so everything it touches must be
//! async-signal-safe: a fixed table of region slots holding atomics, plus
//! `mprotect`. Slots are claimed and released by [`register_region`] /
//! [`unregister_region`] from normal context; the handler only ever reads
//! them. Faults that do not land inside a registered region are forwarded to
//! the handler that was installed before ours.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Once;

const MAX_GUARDED_REGIONS: usize = 256;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if size > 0 { size as usize } else { 4096 };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

struct RegionSlot {
    claimed: AtomicBool,
    /// Guarded span; `start == 0` means the slot is invisible to the handler.
    start: AtomicUsize,
    end: AtomicUsize,
    words: AtomicPtr<AtomicU64>,
    word_capacity: AtomicUsize,
}

impl RegionSlot {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            words: AtomicPtr::new(std::ptr::null_mut()),
            word_capacity: AtomicUsize::new(0),
        }
    }
}

static SLOTS: [RegionSlot; MAX_GUARDED_REGIONS] = [const { RegionSlot::new() }; MAX_GUARDED_REGIONS];

pub(crate) struct RegionHandle {
    slot: usize,
    pages: usize,
}

impl RegionHandle {
    pub(crate) fn pages(&self) -> usize {
        self.pages
    }
}

/// Claims a slot for a page-aligned span. Returns `None` when all slots are
/// in use; the caller falls back to full-refresh tracking.
pub(crate) fn register_region(start: usize, len: usize) -> Option<RegionHandle> {
    install_handler();

    let page_size = page_size();
    debug_assert_eq!(start % page_size, 0);
    debug_assert_eq!(len % page_size, 0);
    let pages = len / page_size;
    let words = pages.div_ceil(64);

    for (index, slot) in SLOTS.iter().enumerate() {
        if slot
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }

        if slot.word_capacity.load(Ordering::Relaxed) < words {
            let table: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
            // An in-flight fault handler may still hold the old pointer, so
            // outgrown tables are leaked rather than freed. Growth is bounded
            // by the largest mapping each slot ever tracks.
            slot.words
                .store(Box::leak(table).as_mut_ptr(), Ordering::Release);
            slot.word_capacity.store(words, Ordering::Release);
        } else {
            let table = slot.words.load(Ordering::Acquire);
            for word in 0..words {
                unsafe { (*table.add(word)).store(0, Ordering::Relaxed) };
            }
        }

        // The handler checks `start` last, so publish the span end first.
        slot.end.store(start + len, Ordering::Release);
        slot.start.store(start, Ordering::Release);
        return Some(RegionHandle { slot: index, pages });
    }

    None
}

pub(crate) fn unregister_region(handle: &RegionHandle) {
    let slot = &SLOTS[handle.slot];
    slot.start.store(0, Ordering::Release);
    slot.end.store(0, Ordering::Release);
    slot.claimed.store(false, Ordering::Release);
}

/// Atomically drains the dirty bitmap into `out`, one u64 per 64 pages.
pub(crate) fn take_dirty_words(handle: &RegionHandle, out: &mut Vec<u64>) {
    out.clear();
    let slot = &SLOTS[handle.slot];
    let table = slot.words.load(Ordering::Acquire);
    for word in 0..handle.pages.div_ceil(64) {
        out.push(unsafe { (*table.add(word)).swap(0, Ordering::AcqRel) });
    }
}

/// # Safety
/// `addr` must be page-aligned and `[addr, addr + len)` must be a mapping
/// owned by the caller for the duration of the protection.
pub(crate) unsafe fn protect_readonly(addr: *mut u8, len: usize) -> bool {
    libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ) == 0
}

/// # Safety
/// Same contract as [`protect_readonly`].
pub(crate) unsafe fn protect_readwrite(addr: *mut u8, len: usize) -> bool {
    libc::mprotect(
        addr as *mut libc::c_void,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

static PREV_HANDLER: AtomicUsize = AtomicUsize::new(0);
static PREV_FLAGS: AtomicI32 = AtomicI32::new(0);
static INSTALL: Once = Once::new();

fn install_handler() {
    INSTALL.call_once(|| {
        // Prime the page-size cache so the handler never calls sysconf.
        let _ = page_size();
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_fault as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGSEGV, &action, &mut previous) == 0 {
                PREV_HANDLER.store(previous.sa_sigaction, Ordering::Relaxed);
                PREV_FLAGS.store(previous.sa_flags as i32, Ordering::Relaxed);
            }
        }
    });
}

extern "C" fn handle_fault(signum: i32, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // libc models `si_addr` as an accessor on Linux and a plain field on the
    // BSD-derived targets.
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    let addr = unsafe { (*info).si_addr } as usize;
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    let addr = unsafe { (*info).si_addr() } as usize;
    let shift = page_size().trailing_zeros();

    for slot in SLOTS.iter() {
        let start = slot.start.load(Ordering::Acquire);
        if start == 0 || addr < start {
            continue;
        }
        if addr >= slot.end.load(Ordering::Acquire) {
            continue;
        }

        let page = (addr - start) >> shift;
        let table = slot.words.load(Ordering::Acquire);
        if table.is_null() || page / 64 >= slot.word_capacity.load(Ordering::Acquire) {
            continue;
        }

        unsafe {
            (*table.add(page / 64)).fetch_or(1 << (page % 64), Ordering::AcqRel);
            let page_addr = start + (page << shift);
            libc::mprotect(
                page_addr as *mut libc::c_void,
                1usize << shift,
                libc::PROT_READ | libc::PROT_WRITE,
            );
        }
        return;
    }

    forward_to_previous(signum, info, context);
}

fn forward_to_previous(signum: i32, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let previous = PREV_HANDLER.load(Ordering::Relaxed);
    if previous == libc::SIG_DFL {
        // Restore the default action and return; the faulting instruction
        // re-executes and the process terminates with the default SIGSEGV
        // disposition.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
        }
        return;
    }
    if previous == libc::SIG_IGN {
        return;
    }

    let flags = PREV_FLAGS.load(Ordering::Relaxed);
    unsafe {
        if flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(previous);
            handler(signum, info, context);
        } else {
            let handler: extern "C" fn(i32) = std::mem::transmute(previous);
            handler(signum);
        }
    }
}
