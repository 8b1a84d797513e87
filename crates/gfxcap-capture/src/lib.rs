//! Capture manager core for a low-level graphics API.
//!
//! The interception shims route every traced call through here: each thread
//! encodes the call's arguments into its own buffer, and the manager frames
//! the bytes into the capture stream behind a single file lock. A trim
//! configuration turns recording on and off at frame boundaries, replaying
//! tracked object state into each new file so every capture is a replayable
//! prefix. Three interchangeable memory-tracking strategies guarantee that
//! every host write to mapped GPU memory reaches the stream before the
//! submit that consumes it.
//!
//! The wire layout lives in [`gfxcap_format`]; page-protection based dirty
//! tracking lives in [`gfxcap_pageguard`].

mod compress;
mod encoder;
mod error;
mod file;
mod manager;
mod settings;
mod state;
mod thread;
mod update_template;

pub use compress::{create_compressor, Compressor};
pub use encoder::ParameterEncoder;
pub use error::{CaptureError, Result};
pub use manager::{
    check_create_instance_result, create_instance, destroy_instance, instance, CaptureManager,
    CaptureMode,
};
pub use settings::{parse_trim_ranges, CaptureSettings, MemoryTrackingMode, TrimRange};
pub use state::{
    DeviceMemoryWrapper, DriverResult, MappedMemory, MappedMemoryRange, MemoryMapObserver,
    NullStateTracker, QueueSubmitObserver, StateTracker, StateWriter, WindowResizeObserver,
    WHOLE_SIZE,
};
pub use thread::current_thread_id;
pub use update_template::{
    DescriptorType, UpdateTemplateEntry, UpdateTemplateInfo, BUFFER_DESCRIPTOR_PAYLOAD_SIZE,
    IMAGE_DESCRIPTOR_PAYLOAD_SIZE, TEXEL_BUFFER_VIEW_PAYLOAD_SIZE,
};
