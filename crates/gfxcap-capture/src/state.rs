//! Contracts with the external collaborators: the handle-wrapping layer
//! (memory wrappers), the state tracker, and the interception shims (the
//! observer interfaces the manager implements).

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use gfxcap_format::{
    ApiCallId, BeginResourceInitCommand, CompressedFunctionCallHeader, DisplayMessageCommandHeader,
    EndResourceInitCommand, FillMemoryCommandHeader, FunctionCallHeader, HandleId,
    InitBufferCommandHeader, InitImageCommandHeader, ThreadId,
};

use crate::compress::Compressor;
use crate::file::CaptureFileWriter;
use crate::update_template::UpdateTemplateInfo;

/// Sentinel for "through the end of the allocation" in map and flush sizes.
pub const WHOLE_SIZE: u64 = u64::MAX;

/// A return code from the wrapped driver, passed through verbatim. The core
/// only inspects it to decline state updates after failed calls; negative
/// codes are errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverResult(pub i32);

impl DriverResult {
    pub const SUCCESS: DriverResult = DriverResult(0);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }
}

/// The host-visible window of a memory object while it is mapped. `data` is
/// the pointer returned by the driver and already includes `offset`.
#[derive(Clone, Copy, Debug)]
pub struct MappedMemory {
    pub data: *mut u8,
    pub offset: u64,
    /// Resolved size in bytes; the `WHOLE_SIZE` sentinel is expanded when the
    /// mapping is recorded.
    pub size: u64,
}

/// The slice of a device-memory wrapper the core consumes. Wrappers are owned
/// by the handle-wrapping layer and shared with the core as `Arc`s; the core
/// itself only keys on the opaque handle id.
pub struct DeviceMemoryWrapper {
    handle_id: HandleId,
    allocation_size: AtomicU64,
    mapped: Mutex<Option<MappedMemory>>,
}

// SAFETY: `MappedMemory::data` points into a driver mapping that the wrapping
// layer keeps valid for as long as the wrapper reports it mapped; all access
// to the pointer goes through the mutex.
unsafe impl Send for DeviceMemoryWrapper {}
unsafe impl Sync for DeviceMemoryWrapper {}

impl DeviceMemoryWrapper {
    pub fn new(handle_id: HandleId) -> Self {
        Self {
            handle_id,
            allocation_size: AtomicU64::new(0),
            mapped: Mutex::new(None),
        }
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    pub fn allocation_size(&self) -> u64 {
        self.allocation_size.load(Ordering::Acquire)
    }

    pub fn set_allocation_size(&self, size: u64) {
        self.allocation_size.store(size, Ordering::Release);
    }

    /// Snapshot of the current mapping, if any.
    pub fn mapped(&self) -> Option<MappedMemory> {
        *self.mapped.lock().unwrap()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.lock().unwrap().is_some()
    }

    pub(crate) fn lock_mapped(&self) -> MutexGuard<'_, Option<MappedMemory>> {
        self.mapped.lock().unwrap()
    }

    pub(crate) fn take_mapped(&self) -> Option<MappedMemory> {
        self.mapped.lock().unwrap().take()
    }
}

/// One element of a flush request. `offset` is relative to the start of the
/// memory object, not to the mapped pointer.
#[derive(Clone)]
pub struct MappedMemoryRange {
    pub memory: Arc<DeviceMemoryWrapper>,
    pub offset: u64,
    pub size: u64,
}

/// Emits the synthesized blocks of a state snapshot into the capture file.
/// Borrowed by the state tracker for the duration of one trim activation;
/// the caller already holds the file lock.
pub struct StateWriter<'a> {
    file: &'a mut CaptureFileWriter,
    compressor: Option<Arc<dyn Compressor>>,
    thread_id: ThreadId,
    scratch: Vec<u8>,
}

impl<'a> StateWriter<'a> {
    pub(crate) fn new(
        file: &'a mut CaptureFileWriter,
        compressor: Option<Arc<dyn Compressor>>,
        thread_id: ThreadId,
    ) -> Self {
        Self {
            file,
            compressor,
            thread_id,
            scratch: Vec::new(),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Writes a synthesized function-call block, compressed when smaller.
    pub fn write_function_call(&mut self, call_id: ApiCallId, args: &[u8]) -> io::Result<()> {
        if let Some(compressor) = self.compressor.clone() {
            let compressed_len = compressor.compress(args, &mut self.scratch);
            if compressed_len > 0 && compressed_len < args.len() {
                let mut header = Vec::with_capacity(CompressedFunctionCallHeader::ENCODED_LEN);
                CompressedFunctionCallHeader::new(
                    call_id,
                    self.thread_id,
                    args.len() as u64,
                    compressed_len,
                )
                .encode_into(&mut header);
                return self.file.write_block(&header, &self.scratch[..compressed_len]);
            }
        }

        let mut header = Vec::with_capacity(FunctionCallHeader::ENCODED_LEN);
        FunctionCallHeader::new(call_id, self.thread_id, args.len()).encode_into(&mut header);
        self.file.write_block(&header, args)
    }

    pub fn write_fill_memory(
        &mut self,
        memory_id: HandleId,
        offset: u64,
        bytes: &[u8],
    ) -> io::Result<()> {
        let mut compressed_len = 0;
        if let Some(compressor) = self.compressor.clone() {
            compressed_len = compressor.compress(bytes, &mut self.scratch);
        }
        let compressed = compressed_len > 0 && compressed_len < bytes.len();
        let payload: &[u8] = if compressed {
            &self.scratch[..compressed_len]
        } else {
            bytes
        };

        let mut header = Vec::with_capacity(FillMemoryCommandHeader::ENCODED_LEN);
        FillMemoryCommandHeader::new(
            self.thread_id,
            memory_id,
            offset,
            bytes.len() as u64,
            payload.len(),
            compressed,
        )
        .encode_into(&mut header);
        self.file.write_block(&header, payload)
    }

    pub fn write_display_message(&mut self, message: &str) -> io::Result<()> {
        let mut header = Vec::with_capacity(DisplayMessageCommandHeader::ENCODED_LEN);
        DisplayMessageCommandHeader::new(self.thread_id, message.len()).encode_into(&mut header);
        self.file.write_block(&header, message.as_bytes())
    }

    pub fn write_begin_resource_init(
        &mut self,
        device_id: HandleId,
        max_resource_size: u64,
        max_copy_size: u64,
    ) -> io::Result<()> {
        let mut header = Vec::with_capacity(BeginResourceInitCommand::ENCODED_LEN);
        BeginResourceInitCommand::new(self.thread_id, device_id, max_resource_size, max_copy_size)
            .encode_into(&mut header);
        self.file.write_block(&header, &[])
    }

    pub fn write_end_resource_init(&mut self, device_id: HandleId) -> io::Result<()> {
        let mut header = Vec::with_capacity(EndResourceInitCommand::ENCODED_LEN);
        EndResourceInitCommand::new(self.thread_id, device_id).encode_into(&mut header);
        self.file.write_block(&header, &[])
    }

    pub fn write_init_buffer(
        &mut self,
        device_id: HandleId,
        buffer_id: HandleId,
        data: &[u8],
    ) -> io::Result<()> {
        let mut header = Vec::with_capacity(InitBufferCommandHeader::ENCODED_LEN);
        InitBufferCommandHeader::new(self.thread_id, device_id, buffer_id, data.len() as u64)
            .encode_into(&mut header);
        self.file.write_block(&header, data)
    }

    pub fn write_init_image(
        &mut self,
        device_id: HandleId,
        image_id: HandleId,
        aspect: u32,
        layout: u32,
        level_sizes: &[u64],
        data: &[u8],
    ) -> io::Result<()> {
        let mut header = Vec::with_capacity(
            InitImageCommandHeader::ENCODED_LEN + level_sizes.len() * 8,
        );
        InitImageCommandHeader::new(
            self.thread_id,
            device_id,
            image_id,
            data.len() as u64,
            aspect,
            layout,
            level_sizes.len() as u32,
        )
        .encode_into(&mut header);
        for level_size in level_sizes {
            header.extend_from_slice(&level_size.to_le_bytes());
        }
        self.file.write_block(&header, data)
    }
}

/// Maintains an inventory of live driver objects while tracking is active and
/// replays it as creation/initialization blocks when a trim range opens.
/// The real implementation lives with the handle-wrapping layer.
pub trait StateTracker: Send {
    /// Walks the inventory and emits an equivalent sequence of blocks, in
    /// dependency order.
    fn write_state(&mut self, writer: &mut StateWriter<'_>) -> io::Result<()>;

    fn track_mapped_memory(&mut self, _memory: &DeviceMemoryWrapper, _mapped: Option<MappedMemory>) {
    }

    fn track_descriptor_set_update(
        &mut self,
        _set: HandleId,
        _info: &UpdateTemplateInfo,
        _data: &[u8],
    ) {
    }
}

/// Stand-in used when no tracker is supplied; snapshots are empty.
pub struct NullStateTracker;

impl StateTracker for NullStateTracker {
    fn write_state(&mut self, _writer: &mut StateWriter<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Hooks invoked by the shims around the driver's memory entry points.
pub trait MemoryMapObserver {
    /// Post-allocation: records the allocation size needed to resolve
    /// whole-size mappings later.
    fn memory_allocated(
        &self,
        result: DriverResult,
        memory: &Arc<DeviceMemoryWrapper>,
        allocation_size: u64,
    );

    /// Post-map: records the mapping and returns the pointer to hand to the
    /// application (the page-guard interposition pointer when active).
    fn memory_mapped(
        &self,
        result: DriverResult,
        memory: &Arc<DeviceMemoryWrapper>,
        data: *mut u8,
        offset: u64,
        size: u64,
    ) -> *mut u8;

    /// Pre-flush: emits fill-memory blocks for the supplied ranges.
    fn memory_flush_ranges(&self, ranges: &[MappedMemoryRange]);

    /// Pre-unmap: final flush of the mapping, then stops tracking it.
    fn memory_unmapped(&self, memory: &Arc<DeviceMemoryWrapper>);

    /// Pre-free: stops tracking without a flush.
    fn memory_freed(&self, memory: &Arc<DeviceMemoryWrapper>);
}

/// Hook invoked before every queue submission; guarantees all host writes to
/// mapped memory are in the stream before the submit's call block.
pub trait QueueSubmitObserver {
    fn pre_queue_submit(&self);
}

/// Hook invoked when a presentable surface is (re)created with an extent.
pub trait WindowResizeObserver {
    fn window_resized(&self, surface_id: HandleId, width: u32, height: u32);
}
