//! Memory-tracking strategies: every host write to mapped memory must be in
//! the stream as a fill-memory block before the submit that consumes it.

mod common;

use std::sync::Arc;

use gfxcap_capture::{
    CaptureManager, CaptureSettings, DeviceMemoryWrapper, DriverResult, MappedMemoryRange,
    MemoryMapObserver, MemoryTrackingMode, QueueSubmitObserver, WHOLE_SIZE,
};
use gfxcap_format::{ApiCallId, CompressionType};

use common::read_capture;

const SUBMIT_CALL: ApiCallId = ApiCallId(0x200);

fn settings_in(dir: &tempfile::TempDir, mode: MemoryTrackingMode) -> CaptureSettings {
    CaptureSettings {
        capture_file: dir
            .path()
            .join("cap.gcap")
            .to_string_lossy()
            .into_owned(),
        time_stamp_file: false,
        compression_type: CompressionType::None,
        memory_tracking_mode: mode,
        ..CaptureSettings::default()
    }
}

#[test]
fn unassisted_submit_writes_whole_mapped_regions_before_the_call() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CaptureManager::initialize(settings_in(&dir, MemoryTrackingMode::Unassisted));

    let wrapper = Arc::new(DeviceMemoryWrapper::new(5));
    manager.memory_allocated(DriverResult::SUCCESS, &wrapper, 1024);

    let mut backing = vec![0u8; 1024];
    let mapped =
        manager.memory_mapped(DriverResult::SUCCESS, &wrapper, backing.as_mut_ptr(), 0, WHOLE_SIZE);
    assert_eq!(mapped, backing.as_mut_ptr(), "unassisted mode does not interpose");

    backing[0] = 0x10;
    backing[1023] = 0x99;

    manager.pre_queue_submit();
    manager.trace_api_call(SUBMIT_CALL, |_| {});
    drop(manager);

    let capture = read_capture(&dir.path().join("cap.gcap"));
    assert_eq!(capture.blocks.len(), 2);

    let fill = capture.blocks[0]
        .as_fill_memory()
        .expect("fill-memory precedes the submit call block");
    assert_eq!(fill.memory_id, 5);
    assert_eq!(fill.offset, 0);
    assert_eq!(fill.size, 1024, "whole-size mapping resolves to the allocation");
    assert_eq!(fill.payload[0], 0x10);
    assert_eq!(fill.payload[1023], 0x99);

    let (call_id, _, _) = capture.blocks[1].as_function_call().expect("submit call");
    assert_eq!(call_id, SUBMIT_CALL.0);
}

#[test]
fn unassisted_unmap_writes_the_region_once_more_and_stops_tracking() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CaptureManager::initialize(settings_in(&dir, MemoryTrackingMode::Unassisted));

    let wrapper = Arc::new(DeviceMemoryWrapper::new(9));
    manager.memory_allocated(DriverResult::SUCCESS, &wrapper, 256);
    let mut backing = vec![7u8; 256];
    manager.memory_mapped(DriverResult::SUCCESS, &wrapper, backing.as_mut_ptr(), 0, 256);

    manager.memory_unmapped(&wrapper);
    assert!(!wrapper.is_mapped());

    // After the unmap, submits see nothing to flush.
    manager.pre_queue_submit();
    drop(manager);

    let capture = read_capture(&dir.path().join("cap.gcap"));
    let fills = capture.fill_memory_commands();
    assert_eq!(fills.len(), 1, "one final fill at unmap, none at later submits");
    assert_eq!(fills[0].memory_id, 9);
    assert_eq!(fills[0].size, 256);
    assert_eq!(fills[0].payload, vec![7u8; 256]);
}

#[test]
fn assisted_flush_rebases_offsets_against_the_mapped_pointer() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CaptureManager::initialize(settings_in(&dir, MemoryTrackingMode::Assisted));

    // Allocation of 576 bytes, mapped from offset 64 through the end.
    let wrapper = Arc::new(DeviceMemoryWrapper::new(11));
    manager.memory_allocated(DriverResult::SUCCESS, &wrapper, 576);
    let mut backing = vec![0u8; 512];
    for (index, byte) in backing.iter_mut().enumerate() {
        *byte = index as u8;
    }
    manager.memory_mapped(DriverResult::SUCCESS, &wrapper, backing.as_mut_ptr(), 64, 512);

    // Range offsets are memory-relative; 128 into the object is 64 into the
    // mapping.
    manager.memory_flush_ranges(&[MappedMemoryRange {
        memory: wrapper.clone(),
        offset: 128,
        size: 64,
    }]);

    // A whole-size range runs to the end of the allocation.
    manager.memory_flush_ranges(&[MappedMemoryRange {
        memory: wrapper.clone(),
        offset: 256,
        size: WHOLE_SIZE,
    }]);
    drop(manager);

    let capture = read_capture(&dir.path().join("cap.gcap"));
    let fills = capture.fill_memory_commands();
    assert_eq!(fills.len(), 2);

    assert_eq!(fills[0].memory_id, 11);
    assert_eq!(fills[0].offset, 64);
    assert_eq!(fills[0].size, 64);
    assert_eq!(fills[0].payload, backing[64..128].to_vec());

    assert_eq!(fills[1].offset, 192);
    assert_eq!(fills[1].size, 576 - 256);
    assert_eq!(fills[1].payload, backing[192..512].to_vec());
}

#[test]
fn identical_fills_produce_identical_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CaptureManager::initialize(settings_in(&dir, MemoryTrackingMode::Assisted));

    let bytes = [3u8, 1, 4, 1, 5, 9, 2, 6];
    manager.write_fill_memory_cmd(21, 32, &bytes);
    manager.write_fill_memory_cmd(21, 32, &bytes);
    drop(manager);

    let capture = read_capture(&dir.path().join("cap.gcap"));
    assert_eq!(capture.blocks.len(), 2);
    assert_eq!(capture.blocks[0], capture.blocks[1]);
}

#[test]
fn mapping_is_rejected_when_the_driver_call_failed() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CaptureManager::initialize(settings_in(&dir, MemoryTrackingMode::Unassisted));

    let wrapper = Arc::new(DeviceMemoryWrapper::new(3));
    manager.memory_allocated(DriverResult(-1), &wrapper, 1024);
    assert_eq!(wrapper.allocation_size(), 0);

    let mut backing = vec![0u8; 64];
    manager.memory_mapped(DriverResult(-1), &wrapper, backing.as_mut_ptr(), 0, 64);
    assert!(!wrapper.is_mapped());

    manager.pre_queue_submit();
    drop(manager);

    let capture = read_capture(&dir.path().join("cap.gcap"));
    assert!(capture.fill_memory_commands().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn page_guard_flush_emits_only_dirty_pages() {
    let page = gfxcap_pageguard::system_page_size();
    let dir = tempfile::tempdir().unwrap();
    let manager = CaptureManager::initialize(settings_in(&dir, MemoryTrackingMode::PageGuard));

    let wrapper = Arc::new(DeviceMemoryWrapper::new(17));
    manager.memory_allocated(DriverResult::SUCCESS, &wrapper, (2 * page) as u64);
    let mut backing = vec![0u8; 2 * page];
    let guarded = manager.memory_mapped(
        DriverResult::SUCCESS,
        &wrapper,
        backing.as_mut_ptr(),
        0,
        WHOLE_SIZE,
    );
    assert_ne!(
        guarded,
        backing.as_mut_ptr(),
        "page-guard mode interposes a shadow pointer"
    );

    // Dirty only the first page.
    unsafe { guarded.add(3).write_volatile(0x42) };

    manager.memory_flush_ranges(&[MappedMemoryRange {
        memory: wrapper.clone(),
        offset: 0,
        size: WHOLE_SIZE,
    }]);

    manager.memory_unmapped(&wrapper);
    drop(manager);

    let capture = read_capture(&dir.path().join("cap.gcap"));
    let fills = capture.fill_memory_commands();
    assert_eq!(fills.len(), 1, "one dirty page, one fill");
    assert_eq!(fills[0].memory_id, 17);
    assert_eq!(fills[0].offset, 0);
    assert_eq!(fills[0].size, page as u64);
    assert_eq!(fills[0].payload[3], 0x42);

    // The write was propagated to the driver's mapping as well.
    assert_eq!(backing[3], 0x42);
}
