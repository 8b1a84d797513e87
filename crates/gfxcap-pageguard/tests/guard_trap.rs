//! End-to-end trap exercise: writes through a guarded shadow mapping must
//! fault, be recorded as dirty pages, and surface as contiguous runs.

#![cfg(target_os = "linux")]

use gfxcap_pageguard::{system_page_size, PageGuardManager};

#[test]
fn shadow_guard_records_dirty_runs_and_syncs_back() {
    let page = system_page_size();
    let manager = PageGuardManager::create();

    // Three pages of driver-side memory, pre-filled so the shadow copy-in is
    // observable.
    let mut real = vec![0x11u8; 3 * page];
    let guard = manager.add_memory(7, real.as_mut_ptr(), real.len(), true);
    assert!(!guard.is_null());
    assert_ne!(guard, real.as_mut_ptr(), "shadowing must interpose a distinct pointer");

    // First write to a protected page faults, is marked dirty, and retries.
    unsafe {
        guard.add(10).write_volatile(0xAA);
        guard.add(11).write_volatile(0xAB);
        // Page 2, leaving page 1 clean to split the runs.
        guard.add(2 * page + 5).write_volatile(0xCC);
    }

    let mut runs = Vec::new();
    manager.process_memory_entry(7, |id, base, offset, size| {
        let bytes = unsafe { std::slice::from_raw_parts(base.add(offset), size) };
        runs.push((id, offset, size, bytes.to_vec()));
    });

    assert_eq!(runs.len(), 2, "expected two dirty runs, got offsets/sizes only");
    let (id0, off0, size0, ref bytes0) = runs[0];
    assert_eq!(id0, 7);
    assert_eq!(off0, 0);
    assert_eq!(size0, page);
    assert_eq!(bytes0[10], 0xAA);
    assert_eq!(bytes0[11], 0xAB);
    assert_eq!(bytes0[12], 0x11, "untouched bytes keep the seeded contents");

    let (_, off1, size1, ref bytes1) = runs[1];
    assert_eq!(off1, 2 * page);
    assert_eq!(size1, page);
    assert_eq!(bytes1[5], 0xCC);

    // Dirty contents were copied through to the real mapping.
    assert_eq!(real[10], 0xAA);
    assert_eq!(real[2 * page + 5], 0xCC);

    // The flush re-armed the pages: a fresh write faults and is re-reported.
    unsafe { guard.write_volatile(0xEE) };
    let mut second = Vec::new();
    manager.process_memory_entries(|_, _, offset, size| second.push((offset, size)));
    assert_eq!(second, vec![(0, page)]);
    assert_eq!(real[0], 0xEE);

    // A clean flush reports nothing.
    let mut third = Vec::new();
    manager.process_memory_entry(7, |_, _, offset, size| third.push((offset, size)));
    assert!(third.is_empty(), "no writes since the last flush");

    // Unflushed writes still reach the real mapping on removal.
    unsafe { guard.add(page + 1).write_volatile(0xDD) };
    manager.remove_memory(7);
    assert_eq!(real[page + 1], 0xDD);
    assert!(!manager.is_tracked(7));

    PageGuardManager::destroy();
}
