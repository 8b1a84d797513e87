//! Capture configuration, loaded from `GFXCAP_*` environment variables.

use std::path::Path;

use gfxcap_format::CompressionType;
use tracing::warn;

/// A contiguous interval of frames during which call serialization is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimRange {
    /// 1-based first frame of the range.
    pub first_frame: u32,
    /// Number of frames in the range, at least 1.
    pub total: u32,
}

impl TrimRange {
    pub fn last_frame(&self) -> u32 {
        self.first_frame + self.total - 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemoryTrackingMode {
    /// Write-protect mapped pages and trap the first write to each.
    #[default]
    PageGuard,
    /// Trust the application to delimit dirty ranges via explicit flushes.
    Assisted,
    /// No assistance: rewrite every mapped region at each queue submit.
    Unassisted,
}

impl MemoryTrackingMode {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "page_guard" | "pageguard" => Some(Self::PageGuard),
            "assisted" => Some(Self::Assisted),
            "unassisted" => Some(Self::Unassisted),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub capture_file: String,
    pub time_stamp_file: bool,
    pub memory_tracking_mode: MemoryTrackingMode,
    pub force_flush: bool,
    pub compression_type: CompressionType,
    pub trim_ranges: Vec<TrimRange>,
    /// Passed through to the log subsystem as an env-filter directive.
    pub log_level: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            capture_file: "gfxcap_capture.gcap".to_owned(),
            time_stamp_file: true,
            memory_tracking_mode: MemoryTrackingMode::default(),
            force_flush: false,
            compression_type: CompressionType::None,
            trim_ranges: Vec::new(),
            log_level: "info".to_owned(),
        }
    }
}

impl CaptureSettings {
    /// Loads settings from the environment; unparseable values warn and keep
    /// their defaults so a bad variable never disables the host application.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(value) = env_string("GFXCAP_CAPTURE_FILE") {
            settings.capture_file = value;
        }
        if let Some(value) = env_string("GFXCAP_TIMESTAMP_FILE") {
            match parse_bool(&value) {
                Some(flag) => settings.time_stamp_file = flag,
                None => warn!(value = %value, "ignoring invalid GFXCAP_TIMESTAMP_FILE"),
            }
        }
        if let Some(value) = env_string("GFXCAP_MEMORY_TRACKING_MODE") {
            match MemoryTrackingMode::parse(&value) {
                Some(mode) => settings.memory_tracking_mode = mode,
                None => warn!(value = %value, "ignoring invalid GFXCAP_MEMORY_TRACKING_MODE"),
            }
        }
        if let Some(value) = env_string("GFXCAP_FORCE_FLUSH") {
            match parse_bool(&value) {
                Some(flag) => settings.force_flush = flag,
                None => warn!(value = %value, "ignoring invalid GFXCAP_FORCE_FLUSH"),
            }
        }
        if let Some(value) = env_string("GFXCAP_COMPRESSION_TYPE") {
            match parse_compression(&value) {
                Some(compression) => settings.compression_type = compression,
                None => warn!(value = %value, "ignoring invalid GFXCAP_COMPRESSION_TYPE"),
            }
        }
        if let Some(value) = env_string("GFXCAP_TRIM_RANGES") {
            settings.trim_ranges = parse_trim_ranges(&value);
        }
        if let Some(value) = env_string("GFXCAP_LOG_LEVEL") {
            settings.log_level = value;
        }

        settings
    }
}

fn env_string(var: &'static str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_owned()),
        Ok(_) => None,
        Err(std::env::VarError::NotPresent) => None,
        Err(std::env::VarError::NotUnicode(_)) => {
            warn!(env_var = var, "ignoring {var} because it is not valid unicode");
            None
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_compression(value: &str) -> Option<CompressionType> {
    match value.to_ascii_lowercase().as_str() {
        "none" => Some(CompressionType::None),
        "zlib" => Some(CompressionType::Zlib),
        _ => None,
    }
}

/// Parses `"A-B,C,D-E"` into sorted, non-overlapping ranges. Malformed or
/// out-of-order elements are discarded with a warning; the rest of the list
/// is kept.
pub fn parse_trim_ranges(value: &str) -> Vec<TrimRange> {
    let mut ranges: Vec<TrimRange> = Vec::new();

    for element in value.split(',') {
        let element = element.trim();
        if element.is_empty() {
            continue;
        }

        let parsed = if let Some((first, last)) = element.split_once('-') {
            match (first.trim().parse::<u32>(), last.trim().parse::<u32>()) {
                (Ok(first), Ok(last)) if first >= 1 && last >= first => Some(TrimRange {
                    first_frame: first,
                    total: last - first + 1,
                }),
                _ => None,
            }
        } else {
            match element.parse::<u32>() {
                Ok(frame) if frame >= 1 => Some(TrimRange {
                    first_frame: frame,
                    total: 1,
                }),
                _ => None,
            }
        };

        match parsed {
            Some(range) => {
                if let Some(previous) = ranges.last() {
                    if range.first_frame <= previous.last_frame() {
                        warn!(element, "ignoring out-of-order or overlapping trim range");
                        continue;
                    }
                }
                ranges.push(range);
            }
            None => warn!(element, "ignoring malformed trim range"),
        }
    }

    ranges
}

/// Inserts `postfix` into `base` just before its final extension.
pub(crate) fn insert_filename_postfix(base: &str, postfix: &str) -> String {
    let path = Path::new(base);
    let stem = path.file_stem().and_then(|s| s.to_str());
    let extension = path.extension().and_then(|e| e.to_str());
    match (stem, extension) {
        (Some(stem), Some(extension)) => {
            let parent = path.parent().unwrap_or_else(|| Path::new(""));
            parent
                .join(format!("{stem}{postfix}.{extension}"))
                .to_string_lossy()
                .into_owned()
        }
        _ => format!("{base}{postfix}"),
    }
}

pub(crate) fn timestamped_filename(base: &str) -> String {
    let stamp = chrono::Local::now().format("_%Y%m%dT%H%M%S").to_string();
    insert_filename_postfix(base, &stamp)
}

pub(crate) fn trim_range_filename(base: &str, range: &TrimRange) -> String {
    debug_assert!(range.total >= 1);
    let postfix = if range.total == 1 {
        format!("_frame_{}", range.first_frame)
    } else {
        format!("_frames_{}_through_{}", range.first_frame, range.last_frame())
    };
    insert_filename_postfix(base, &postfix)
}
