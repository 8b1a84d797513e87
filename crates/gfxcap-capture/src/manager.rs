//! The process-wide capture manager.
//!
//! Lock order (outermost first): mapped_memory -> trim -> update_templates ->
//! file -> state_tracker -> compressor. Paths that hold a lock while taking a
//! later one are the end-of-frame machine (trim -> file -> state_tracker),
//! the unassisted submit flush (mapped_memory -> file, and -> trim on a write
//! error), and template-driven tracking (update_templates -> state_tracker);
//! nothing acquires locks against this order.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use gfxcap_format::{
    ApiCallId, CompressedFunctionCallHeader, CompressionType, DisplayMessageCommandHeader,
    FillMemoryCommandHeader, FunctionCallHeader, HandleId, ResizeWindowCommand,
};
use gfxcap_pageguard::PageGuardManager;
use tracing::{error, info, warn};

use crate::compress::{create_compressor, Compressor};
use crate::encoder::ParameterEncoder;
use crate::error::Result;
use crate::file::CaptureFileWriter;
use crate::settings::{
    timestamped_filename, trim_range_filename, CaptureSettings, MemoryTrackingMode, TrimRange,
};
use crate::state::{
    DeviceMemoryWrapper, DriverResult, MappedMemory, MappedMemoryRange, MemoryMapObserver,
    NullStateTracker, QueueSubmitObserver, StateTracker, StateWriter, WindowResizeObserver,
    WHOLE_SIZE,
};
use crate::thread::{current_thread_id, with_thread_data};
use crate::update_template::{build_update_template_info, UpdateTemplateEntry, UpdateTemplateInfo};

/// Frame counting is 1-based.
const FIRST_FRAME: u32 = 1;

bitflags! {
    /// The two independent capture activities. Empty bits mean capture is
    /// disabled, either terminally (all trim ranges consumed, or a fatal
    /// error) or because initialization failed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CaptureMode: u8 {
        /// Serialize calls into the capture file.
        const WRITE = 0b01;
        /// Maintain object state for a future snapshot.
        const TRACK = 0b10;
    }
}

struct TrimState {
    enabled: bool,
    ranges: Vec<TrimRange>,
    current_range: usize,
    current_frame: u32,
}

pub struct CaptureManager {
    mode: AtomicU8,
    base_filename: String,
    timestamp_filename: bool,
    force_flush: bool,
    memory_tracking_mode: MemoryTrackingMode,
    compression_type: CompressionType,
    trim: Mutex<TrimState>,
    file: Mutex<Option<CaptureFileWriter>>,
    compressor: RwLock<Option<Arc<dyn Compressor>>>,
    state_tracker: Mutex<Option<Box<dyn StateTracker>>>,
    /// Wrappers currently mapped, tracked only in unassisted mode.
    mapped_memory: Mutex<HashMap<HandleId, Arc<DeviceMemoryWrapper>>>,
    update_templates: Mutex<HashMap<HandleId, UpdateTemplateInfo>>,
    unique_id_counter: AtomicU64,
    page_guard: Option<Arc<PageGuardManager>>,
}

struct InstanceSlot {
    manager: Arc<CaptureManager>,
    refcount: u32,
}

static INSTANCE: Mutex<Option<InstanceSlot>> = Mutex::new(None);

/// References the process-wide manager, creating it on the first call. The
/// first driver-instance creation lands here; settings come from the
/// environment. Initialization failures leave capture disabled but never
/// break the host.
pub fn create_instance() -> Arc<CaptureManager> {
    let mut slot = INSTANCE.lock().unwrap();
    match slot.as_mut() {
        Some(existing) => {
            existing.refcount += 1;
            existing.manager.clone()
        }
        None => {
            let settings = CaptureSettings::from_env();
            init_logging(&settings);
            let manager = CaptureManager::initialize(settings);
            *slot = Some(InstanceSlot {
                manager: manager.clone(),
                refcount: 1,
            });
            manager
        }
    }
}

pub fn instance() -> Option<Arc<CaptureManager>> {
    INSTANCE.lock().unwrap().as_ref().map(|s| s.manager.clone())
}

/// Drops one reference; the last driver-instance destruction tears the
/// manager down.
pub fn destroy_instance() {
    let mut slot = INSTANCE.lock().unwrap();
    if let Some(existing) = slot.as_mut() {
        existing.refcount -= 1;
        if existing.refcount == 0 {
            *slot = None;
        }
    }
}

/// Rolls back the reference added by the create hook when the driver's
/// instance creation failed.
pub fn check_create_instance_result(result: DriverResult) {
    if !result.is_success() {
        destroy_instance();
    }
}

fn init_logging(settings: &CaptureSettings) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // The host may already have a subscriber installed; keep theirs.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn create_capture_file(
    base_filename: &str,
    timestamp: bool,
    compression: CompressionType,
) -> Result<CaptureFileWriter> {
    let filename = if timestamp {
        timestamped_filename(base_filename)
    } else {
        base_filename.to_owned()
    };
    let writer = CaptureFileWriter::create(&filename, compression)?;
    info!(file = %filename, "recording graphics API capture");
    Ok(writer)
}

impl CaptureManager {
    /// Builds a manager from explicit settings with an empty state tracker.
    pub fn initialize(settings: CaptureSettings) -> Arc<Self> {
        Self::initialize_with_tracker(settings, Box::new(NullStateTracker))
    }

    /// Builds a manager from explicit settings. The tracker is retained only
    /// when the trim configuration requires tracking.
    pub fn initialize_with_tracker(
        settings: CaptureSettings,
        tracker: Box<dyn StateTracker>,
    ) -> Arc<Self> {
        let trim_configured = !settings.trim_ranges.is_empty();

        let mut mode = if trim_configured {
            if settings.trim_ranges[0].first_frame == FIRST_FRAME {
                // Capturing from the first frame only needs tracking when a
                // later range will require a state snapshot.
                if settings.trim_ranges.len() > 1 {
                    CaptureMode::WRITE | CaptureMode::TRACK
                } else {
                    CaptureMode::WRITE
                }
            } else {
                CaptureMode::TRACK
            }
        } else {
            CaptureMode::WRITE
        };

        let mut file = None;
        if mode.contains(CaptureMode::WRITE) {
            let filename = if trim_configured {
                trim_range_filename(&settings.capture_file, &settings.trim_ranges[0])
            } else {
                settings.capture_file.clone()
            };
            match create_capture_file(
                &filename,
                settings.time_stamp_file,
                settings.compression_type,
            ) {
                Ok(writer) => file = Some(writer),
                Err(err) => {
                    error!(%err, "failed to create capture file; capture disabled");
                    mode = CaptureMode::empty();
                }
            }
        }

        let mut compressor = None;
        if !mode.is_empty() {
            match create_compressor(settings.compression_type) {
                Ok(created) => compressor = created,
                Err(err) => {
                    error!(%err, "failed to create compressor; capture disabled");
                    mode = CaptureMode::empty();
                    file = None;
                }
            }
        }

        let page_guard = if !mode.is_empty()
            && settings.memory_tracking_mode == MemoryTrackingMode::PageGuard
        {
            Some(PageGuardManager::create())
        } else {
            None
        };

        let state_tracker: Option<Box<dyn StateTracker>> = if mode.contains(CaptureMode::TRACK) {
            Some(tracker)
        } else {
            None
        };

        Arc::new(Self {
            mode: AtomicU8::new(mode.bits()),
            base_filename: settings.capture_file,
            timestamp_filename: settings.time_stamp_file,
            force_flush: settings.force_flush,
            memory_tracking_mode: settings.memory_tracking_mode,
            compression_type: settings.compression_type,
            trim: Mutex::new(TrimState {
                enabled: trim_configured && !mode.is_empty(),
                ranges: settings.trim_ranges,
                current_range: 0,
                current_frame: FIRST_FRAME,
            }),
            file: Mutex::new(file),
            compressor: RwLock::new(compressor),
            state_tracker: Mutex::new(state_tracker),
            mapped_memory: Mutex::new(HashMap::new()),
            update_templates: Mutex::new(HashMap::new()),
            unique_id_counter: AtomicU64::new(0),
            page_guard,
        })
    }

    pub fn capture_mode(&self) -> CaptureMode {
        CaptureMode::from_bits_truncate(self.mode.load(Ordering::Acquire))
    }

    pub fn is_capture_disabled(&self) -> bool {
        self.capture_mode().is_empty()
    }

    pub fn current_frame(&self) -> u32 {
        self.trim.lock().unwrap().current_frame
    }

    pub fn bytes_written(&self) -> u64 {
        self.file
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, CaptureFileWriter::bytes_written)
    }

    /// Monotonically increasing ids for the handle-wrapping layer.
    pub fn assign_handle_id(&self) -> HandleId {
        self.unique_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn set_mode(&self, mode: CaptureMode) {
        self.mode.store(mode.bits(), Ordering::Release);
    }

    /// Stamps the calling thread with the id of the call being encoded.
    /// Never fails and never touches shared state.
    pub fn init_api_call_trace(&self, call_id: ApiCallId) {
        with_thread_data(|data| data.call_id = call_id);
    }

    /// Runs `encode` against the calling thread's parameter encoder.
    pub fn with_encoder<R>(&self, encode: impl FnOnce(&mut ParameterEncoder) -> R) -> R {
        with_thread_data(|data| encode(&mut data.encoder))
    }

    /// Finishes the call started by [`Self::init_api_call_trace`]: when
    /// writing, the encoded arguments are (optionally) compressed and
    /// appended as one block; the encoder is reset either way.
    pub fn end_api_call_trace(&self) {
        if !self.capture_mode().contains(CaptureMode::WRITE) {
            with_thread_data(|data| data.encoder.reset());
            return;
        }

        let write_error = with_thread_data(|data| {
            let uncompressed_size = data.encoder.len();

            let compressor = self.compressor.read().unwrap().clone();
            let mut compressed_len = 0;
            if let Some(compressor) = &compressor {
                compressed_len = compressor.compress(data.encoder.data(), &mut data.compressed);
            }

            let mut header = Vec::with_capacity(CompressedFunctionCallHeader::ENCODED_LEN);
            let payload: &[u8] = if compressed_len > 0 && compressed_len < uncompressed_size {
                CompressedFunctionCallHeader::new(
                    data.call_id,
                    data.thread_id,
                    uncompressed_size as u64,
                    compressed_len,
                )
                .encode_into(&mut header);
                &data.compressed[..compressed_len]
            } else {
                FunctionCallHeader::new(data.call_id, data.thread_id, uncompressed_size)
                    .encode_into(&mut header);
                data.encoder.data()
            };

            let result = {
                let mut file = self.file.lock().unwrap();
                match file.as_mut() {
                    Some(writer) => writer.write_block(&header, payload).and_then(|()| {
                        if self.force_flush {
                            writer.flush()
                        } else {
                            Ok(())
                        }
                    }),
                    None => Ok(()),
                }
            };

            data.encoder.reset();
            result.err()
        });

        if let Some(err) = write_error {
            self.handle_write_error(err);
        }
    }

    /// Convenience for shims: init, encode, end.
    pub fn trace_api_call(&self, call_id: ApiCallId, encode: impl FnOnce(&mut ParameterEncoder)) {
        self.init_api_call_trace(call_id);
        self.with_encoder(encode);
        self.end_api_call_trace();
    }

    /// Advances the trim state machine at a frame boundary. With no trim
    /// configuration the initial mode is permanent and this is a no-op.
    pub fn end_frame(&self) {
        let mut trim = self.trim.lock().unwrap();
        if !trim.enabled {
            return;
        }
        trim.current_frame += 1;

        let mode = self.capture_mode();
        if mode.contains(CaptureMode::WRITE) {
            let current_range = trim.current_range;
            let range = &mut trim.ranges[current_range];
            range.total -= 1;
            if range.total == 0 {
                self.set_mode(mode & !CaptureMode::WRITE);
                *self.file.lock().unwrap() = None;
                info!("finished recording graphics API capture");

                trim.current_range += 1;
                if trim.current_range >= trim.ranges.len() {
                    // No more frames to capture; release everything.
                    trim.enabled = false;
                    self.set_mode(CaptureMode::empty());
                    *self.state_tracker.lock().unwrap() = None;
                    *self.compressor.write().unwrap() = None;
                } else if trim.ranges[trim.current_range].first_frame == trim.current_frame {
                    // Two consecutive ranges: the next frame starts a new
                    // capture file immediately.
                    self.activate_trimming(&mut trim);
                }
            }
        } else if mode.contains(CaptureMode::TRACK)
            && trim.ranges[trim.current_range].first_frame == trim.current_frame
        {
            self.activate_trimming(&mut trim);
        }
    }

    /// Opens the trim range's capture file, turns writing on, and emits the
    /// reconstructed state snapshot. Failure collapses capture to disabled;
    /// the host keeps running.
    fn activate_trimming(&self, trim: &mut TrimState) {
        let filename = trim_range_filename(&self.base_filename, &trim.ranges[trim.current_range]);
        let writer = match create_capture_file(
            &filename,
            self.timestamp_filename,
            self.compression_type,
        ) {
            Ok(writer) => writer,
            Err(err) => {
                error!(%err, "failed to initialize capture for trim range; capture disabled");
                trim.enabled = false;
                self.set_mode(CaptureMode::empty());
                self.release_session_resources();
                return;
            }
        };

        let mut snapshot_failed = false;
        {
            let mut file = self.file.lock().unwrap();
            *file = Some(writer);
            self.set_mode(self.capture_mode() | CaptureMode::WRITE);

            let compressor = self.compressor.read().unwrap().clone();
            let thread_id = current_thread_id();
            let mut tracker_slot = self.state_tracker.lock().unwrap();
            if let (Some(tracker), Some(writer)) = (tracker_slot.as_mut(), file.as_mut()) {
                let mut state_writer = StateWriter::new(writer, compressor, thread_id);
                if let Err(err) = tracker.write_state(&mut state_writer) {
                    error!(%err, "failed to write state snapshot; capture disabled");
                    snapshot_failed = true;
                }
            }
        }
        if snapshot_failed {
            trim.enabled = false;
            self.set_mode(CaptureMode::empty());
            self.release_session_resources();
        }
    }

    fn release_session_resources(&self) {
        *self.file.lock().unwrap() = None;
        *self.state_tracker.lock().unwrap() = None;
        *self.compressor.write().unwrap() = None;
    }

    fn handle_write_error(&self, err: io::Error) {
        error!(%err, "capture file write failed; capture disabled");
        self.set_mode(CaptureMode::empty());
        self.trim.lock().unwrap().enabled = false;
        self.release_session_resources();
    }

    /// Appends one already-encoded block under the file lock, honoring the
    /// force-flush setting. I/O failures disable capture.
    fn write_block(&self, header: &[u8], payload: &[u8]) {
        let result = {
            let mut file = self.file.lock().unwrap();
            match file.as_mut() {
                Some(writer) => writer.write_block(header, payload).and_then(|()| {
                    if self.force_flush {
                        writer.flush()
                    } else {
                        Ok(())
                    }
                }),
                None => Ok(()),
            }
        };
        if let Err(err) = result {
            self.handle_write_error(err);
        }
    }

    /// Emits a replayer-visible message block.
    pub fn write_display_message_cmd(&self, message: &str) {
        if !self.capture_mode().contains(CaptureMode::WRITE) {
            return;
        }
        let mut header = Vec::with_capacity(DisplayMessageCommandHeader::ENCODED_LEN);
        DisplayMessageCommandHeader::new(current_thread_id(), message.len())
            .encode_into(&mut header);
        self.write_block(&header, message.as_bytes());
    }

    pub fn write_resize_window_cmd(&self, surface_id: HandleId, width: u32, height: u32) {
        if !self.capture_mode().contains(CaptureMode::WRITE) {
            return;
        }
        let mut header = Vec::with_capacity(ResizeWindowCommand::ENCODED_LEN);
        ResizeWindowCommand::new(current_thread_id(), surface_id, width, height)
            .encode_into(&mut header);
        self.write_block(&header, &[]);
    }

    /// Emits a fill-memory block for `bytes` at `offset` within the
    /// allocation `memory_id`, compressed when that is strictly smaller.
    pub fn write_fill_memory_cmd(&self, memory_id: HandleId, offset: u64, bytes: &[u8]) {
        if !self.capture_mode().contains(CaptureMode::WRITE) {
            return;
        }

        let write_error = with_thread_data(|data| {
            let compressor = self.compressor.read().unwrap().clone();
            let mut compressed_len = 0;
            if let Some(compressor) = &compressor {
                compressed_len = compressor.compress(bytes, &mut data.compressed);
            }

            let compressed = compressed_len > 0 && compressed_len < bytes.len();
            let payload: &[u8] = if compressed {
                &data.compressed[..compressed_len]
            } else {
                bytes
            };

            let mut header = Vec::with_capacity(FillMemoryCommandHeader::ENCODED_LEN);
            FillMemoryCommandHeader::new(
                data.thread_id,
                memory_id,
                offset,
                bytes.len() as u64,
                payload.len(),
                compressed,
            )
            .encode_into(&mut header);

            let result = {
                let mut file = self.file.lock().unwrap();
                match file.as_mut() {
                    Some(writer) => writer.write_block(&header, payload).and_then(|()| {
                        if self.force_flush {
                            writer.flush()
                        } else {
                            Ok(())
                        }
                    }),
                    None => Ok(()),
                }
            };
            result.err()
        });

        if let Some(err) = write_error {
            self.handle_write_error(err);
        }
    }

    /// Records a template's entries, bucketed by kind. Replaces any previous
    /// record for the same handle.
    pub fn set_descriptor_update_template_info(
        &self,
        update_template: HandleId,
        entries: &[UpdateTemplateEntry],
    ) {
        if entries.is_empty() {
            return;
        }
        let info = build_update_template_info(entries);
        self.update_templates
            .lock()
            .unwrap()
            .insert(update_template, info);
    }

    pub fn remove_descriptor_update_template_info(&self, update_template: HandleId) {
        self.update_templates.lock().unwrap().remove(&update_template);
    }

    /// Looks a template up and passes the stored info to `f`.
    pub fn with_update_template_info<R>(
        &self,
        update_template: HandleId,
        f: impl FnOnce(&UpdateTemplateInfo) -> R,
    ) -> Option<R> {
        self.update_templates
            .lock()
            .unwrap()
            .get(&update_template)
            .map(f)
    }

    /// Forwards a templated descriptor-set update to the state tracker,
    /// bounding the raw update blob by the template's `max_size`.
    ///
    /// # Safety
    /// `data` must be readable for at least the template's `max_size` bytes;
    /// that bound exists precisely so callers can satisfy this.
    pub unsafe fn track_descriptor_set_with_template(
        &self,
        set: HandleId,
        update_template: HandleId,
        data: *const u8,
    ) {
        if !self.capture_mode().contains(CaptureMode::TRACK) || data.is_null() {
            return;
        }
        let templates = self.update_templates.lock().unwrap();
        let Some(info) = templates.get(&update_template) else {
            return;
        };
        if info.max_size == 0 {
            return;
        }
        let bytes = unsafe { std::slice::from_raw_parts(data, info.max_size) };
        if let Some(tracker) = self.state_tracker.lock().unwrap().as_mut() {
            tracker.track_descriptor_set_update(set, info, bytes);
        }
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        if self.page_guard.take().is_some() {
            PageGuardManager::destroy();
        }
    }
}

impl MemoryMapObserver for CaptureManager {
    fn memory_allocated(
        &self,
        result: DriverResult,
        memory: &Arc<DeviceMemoryWrapper>,
        allocation_size: u64,
    ) {
        if result.is_success() {
            memory.set_allocation_size(allocation_size);
        }
    }

    fn memory_mapped(
        &self,
        result: DriverResult,
        memory: &Arc<DeviceMemoryWrapper>,
        data: *mut u8,
        offset: u64,
        size: u64,
    ) -> *mut u8 {
        if !result.is_success() || data.is_null() {
            return data;
        }

        {
            let mut mapped_slot = memory.lock_mapped();
            if mapped_slot.is_some() {
                // The pointer handed out for the first map stays in effect.
                warn!(
                    memory_id = memory.handle_id(),
                    "memory object has been mapped more than once"
                );
                return data;
            }

            let size = if size == WHOLE_SIZE {
                memory.allocation_size().saturating_sub(offset)
            } else {
                size
            };

            *mapped_slot = Some(MappedMemory { data, offset, size });
        }

        let mut effective = data;
        match self.memory_tracking_mode {
            MemoryTrackingMode::PageGuard => {
                let size = memory.mapped().map_or(0, |mapped| mapped.size);
                if size > 0 {
                    if let Some(page_guard) = &self.page_guard {
                        // The application gets the page-guard pointer, which
                        // may be shadow memory rather than the mapping.
                        effective =
                            page_guard.add_memory(memory.handle_id(), data, size as usize, true);
                    }
                }
            }
            MemoryTrackingMode::Unassisted => {
                // Remember the mapping so its contents can be written at
                // every queue submit.
                self.mapped_memory
                    .lock()
                    .unwrap()
                    .insert(memory.handle_id(), memory.clone());
            }
            MemoryTrackingMode::Assisted => {}
        }

        if self.capture_mode().contains(CaptureMode::TRACK) {
            if let Some(tracker) = self.state_tracker.lock().unwrap().as_mut() {
                tracker.track_mapped_memory(memory, memory.mapped());
            }
        }

        effective
    }

    fn memory_flush_ranges(&self, ranges: &[MappedMemoryRange]) {
        match self.memory_tracking_mode {
            MemoryTrackingMode::PageGuard => {
                let Some(page_guard) = &self.page_guard else {
                    return;
                };
                // All dirty pages of an object flush at once, so multiple
                // ranges against the same object collapse to one walk.
                let mut previous: Option<HandleId> = None;
                for range in ranges {
                    let memory_id = range.memory.handle_id();
                    if previous == Some(memory_id) {
                        continue;
                    }
                    previous = Some(memory_id);

                    if range.memory.is_mapped() {
                        page_guard.process_memory_entry(memory_id, |id, base, offset, size| {
                            // SAFETY: the page-guard manager reports runs
                            // inside a region it still tracks.
                            let bytes =
                                unsafe { std::slice::from_raw_parts(base.add(offset), size) };
                            self.write_fill_memory_cmd(id, offset as u64, bytes);
                        });
                    } else {
                        warn!(memory_id, "flush requested for memory that is not mapped");
                    }
                }
            }
            MemoryTrackingMode::Assisted => {
                for range in ranges {
                    let memory_id = range.memory.handle_id();
                    let Some(mapped) = range.memory.mapped() else {
                        warn!(memory_id, "flush requested for memory that is not mapped");
                        continue;
                    };
                    if range.offset < mapped.offset {
                        warn!(memory_id, "flush range precedes the mapped region");
                        continue;
                    }

                    // The mapped pointer already includes the mapped offset;
                    // rebase the range against it.
                    let relative_offset = range.offset - mapped.offset;
                    let size = if range.size == WHOLE_SIZE {
                        range.memory.allocation_size().saturating_sub(range.offset)
                    } else {
                        range.size
                    };

                    // SAFETY: the wrapper reports this mapping live and the
                    // wrapping layer keeps the pointer valid while it is.
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            mapped.data.add(relative_offset as usize),
                            size as usize,
                        )
                    };
                    self.write_fill_memory_cmd(memory_id, relative_offset, bytes);
                }
            }
            MemoryTrackingMode::Unassisted => {}
        }
    }

    fn memory_unmapped(&self, memory: &Arc<DeviceMemoryWrapper>) {
        let Some(mapped) = memory.take_mapped() else {
            warn!(
                memory_id = memory.handle_id(),
                "attempting to unmap memory that has not been mapped"
            );
            return;
        };

        match self.memory_tracking_mode {
            MemoryTrackingMode::PageGuard => {
                if mapped.size > 0 {
                    if let Some(page_guard) = &self.page_guard {
                        page_guard.process_memory_entry(
                            memory.handle_id(),
                            |id, base, offset, size| {
                                // SAFETY: as in `memory_flush_ranges`.
                                let bytes =
                                    unsafe { std::slice::from_raw_parts(base.add(offset), size) };
                                self.write_fill_memory_cmd(id, offset as u64, bytes);
                            },
                        );
                        page_guard.remove_memory(memory.handle_id());
                    }
                }
            }
            MemoryTrackingMode::Unassisted => {
                // Write the whole region once more; offset 0 because the
                // mapped pointer already includes the mapped offset.
                // SAFETY: the mapping is still live during the pre-unmap hook.
                let bytes =
                    unsafe { std::slice::from_raw_parts(mapped.data, mapped.size as usize) };
                self.write_fill_memory_cmd(memory.handle_id(), 0, bytes);
                self.mapped_memory.lock().unwrap().remove(&memory.handle_id());
            }
            MemoryTrackingMode::Assisted => {}
        }

        if self.capture_mode().contains(CaptureMode::TRACK) {
            if let Some(tracker) = self.state_tracker.lock().unwrap().as_mut() {
                tracker.track_mapped_memory(memory, None);
            }
        }
    }

    fn memory_freed(&self, memory: &Arc<DeviceMemoryWrapper>) {
        if memory.is_mapped() {
            match self.memory_tracking_mode {
                MemoryTrackingMode::PageGuard => {
                    if let Some(page_guard) = &self.page_guard {
                        page_guard.remove_memory(memory.handle_id());
                    }
                }
                MemoryTrackingMode::Unassisted => {
                    self.mapped_memory.lock().unwrap().remove(&memory.handle_id());
                }
                MemoryTrackingMode::Assisted => {}
            }
        }
    }
}

impl QueueSubmitObserver for CaptureManager {
    fn pre_queue_submit(&self) {
        match self.memory_tracking_mode {
            MemoryTrackingMode::PageGuard => {
                if let Some(page_guard) = &self.page_guard {
                    page_guard.process_memory_entries(|id, base, offset, size| {
                        // SAFETY: as in `memory_flush_ranges`.
                        let bytes = unsafe { std::slice::from_raw_parts(base.add(offset), size) };
                        self.write_fill_memory_cmd(id, offset as u64, bytes);
                    });
                }
            }
            MemoryTrackingMode::Unassisted => {
                let mapped_memory = self.mapped_memory.lock().unwrap();
                for wrapper in mapped_memory.values() {
                    if let Some(mapped) = wrapper.mapped() {
                        // SAFETY: entries leave this set before their mapping
                        // goes away (unmap and free both erase).
                        let bytes = unsafe {
                            std::slice::from_raw_parts(mapped.data, mapped.size as usize)
                        };
                        self.write_fill_memory_cmd(wrapper.handle_id(), 0, bytes);
                    }
                }
            }
            MemoryTrackingMode::Assisted => {}
        }
    }
}

impl WindowResizeObserver for CaptureManager {
    fn window_resized(&self, surface_id: HandleId, width: u32, height: u32) {
        self.write_resize_window_cmd(surface_id, width, height);
    }
}
