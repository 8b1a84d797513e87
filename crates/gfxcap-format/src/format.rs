//! Typed headers and layout constants for the capture stream.

/// `b"GCAP"` interpreted as a little-endian u32.
pub const CAPTURE_FOURCC: u32 = u32::from_le_bytes(*b"GCAP");

pub const FILE_HEADER_SIZE: usize = 12;
pub const FILE_OPTION_PAIR_SIZE: usize = 8;
pub const BLOCK_HEADER_SIZE: usize = 12;

/// Identifies one entry point of the traced API. Ids are assigned by the
/// generated interception shims; the core treats them as opaque tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ApiCallId(pub u32);

impl ApiCallId {
    pub const UNKNOWN: ApiCallId = ApiCallId(0);
}

/// Stable small integer assigned to each thread by the thread-id registry,
/// widened to u64 on the wire.
pub type ThreadId = u64;

/// Opaque id assigned by the handle-wrapping layer to each driver object.
pub type HandleId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    FunctionCall = 1,
    CompressedFunctionCall = 2,
    MetaData = 3,
    CompressedMetaData = 4,
}

impl BlockType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::FunctionCall),
            2 => Some(Self::CompressedFunctionCall),
            3 => Some(Self::MetaData),
            4 => Some(Self::CompressedMetaData),
            _ => None,
        }
    }
}

/// Tags understood by the replayer inside `MetaData` blocks. The capture core
/// produces only a subset; the rest are reserved for state-snapshot writers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MetaDataType {
    DisplayMessageCommand = 1,
    FillMemoryCommand = 2,
    ResizeWindowCommand = 3,
    SetSwapchainImageStateCommand = 4,
    BeginResourceInitCommand = 5,
    EndResourceInitCommand = 6,
    InitBufferCommand = 7,
    InitImageCommand = 8,
}

impl MetaDataType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::DisplayMessageCommand),
            2 => Some(Self::FillMemoryCommand),
            3 => Some(Self::ResizeWindowCommand),
            4 => Some(Self::SetSwapchainImageStateCommand),
            5 => Some(Self::BeginResourceInitCommand),
            6 => Some(Self::EndResourceInitCommand),
            7 => Some(Self::InitBufferCommand),
            8 => Some(Self::InitImageCommand),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FileOption {
    CompressionType = 1,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum CompressionType {
    #[default]
    None = 0,
    Zlib = 1,
}

impl CompressionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Zlib),
            _ => None,
        }
    }
}

/// Fixed prefix of every capture file.
///
/// The version fields are currently emitted as zero; readers must key format
/// decisions off the option table instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub fourcc: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub num_options: u32,
}

impl FileHeader {
    pub fn new(num_options: u32) -> Self {
        Self {
            fourcc: CAPTURE_FOURCC,
            major_version: 0,
            minor_version: 0,
            num_options,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.fourcc.to_le_bytes());
        out.extend_from_slice(&self.major_version.to_le_bytes());
        out.extend_from_slice(&self.minor_version.to_le_bytes());
        out.extend_from_slice(&self.num_options.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileOptionPair {
    pub option_id: FileOption,
    pub option_value: u32,
}

impl FileOptionPair {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.option_id as u32).to_le_bytes());
        out.extend_from_slice(&self.option_value.to_le_bytes());
    }
}

/// Shared prefix of every block. `size` counts the bytes following the
/// header up to the end of the block, not the total on-disk size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: BlockType,
    pub size: u64,
}

impl BlockHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.block_type as u32).to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }
}

/// Header of an uncompressed function-call block; argument bytes follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionCallHeader {
    pub block_header: BlockHeader,
    pub api_call_id: ApiCallId,
    pub thread_id: ThreadId,
}

impl FunctionCallHeader {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8;

    pub fn new(api_call_id: ApiCallId, thread_id: ThreadId, args_len: usize) -> Self {
        Self {
            block_header: BlockHeader {
                block_type: BlockType::FunctionCall,
                size: (4 + 8 + args_len) as u64,
            },
            api_call_id,
            thread_id,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.block_header.encode_into(out);
        out.extend_from_slice(&self.api_call_id.0.to_le_bytes());
        out.extend_from_slice(&self.thread_id.to_le_bytes());
    }
}

/// Header of a compressed function-call block; compressed argument bytes
/// follow. `uncompressed_size` lets the replayer size its inflate buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressedFunctionCallHeader {
    pub block_header: BlockHeader,
    pub api_call_id: ApiCallId,
    pub thread_id: ThreadId,
    pub uncompressed_size: u64,
}

impl CompressedFunctionCallHeader {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8 + 8;

    pub fn new(
        api_call_id: ApiCallId,
        thread_id: ThreadId,
        uncompressed_size: u64,
        compressed_len: usize,
    ) -> Self {
        Self {
            block_header: BlockHeader {
                block_type: BlockType::CompressedFunctionCall,
                size: (4 + 8 + 8 + compressed_len) as u64,
            },
            api_call_id,
            thread_id,
            uncompressed_size,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.block_header.encode_into(out);
        out.extend_from_slice(&self.api_call_id.0.to_le_bytes());
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
    }
}

/// Shared prefix of metadata blocks: a block header plus the metadata tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaDataHeader {
    pub block_header: BlockHeader,
    pub meta_data_type: MetaDataType,
}

impl MetaDataHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.block_header.encode_into(out);
        out.extend_from_slice(&(self.meta_data_type as u32).to_le_bytes());
    }
}

/// Replays as "overwrite `memory_size` bytes at `memory_offset` within the
/// allocation named `memory_id`". The payload bytes follow the header and are
/// compressed iff the outer block type is `CompressedMetaData`; the
/// uncompressed payload length is always `memory_size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillMemoryCommandHeader {
    pub meta_header: MetaDataHeader,
    pub thread_id: ThreadId,
    pub memory_id: HandleId,
    pub memory_offset: u64,
    pub memory_size: u64,
}

impl FillMemoryCommandHeader {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8 * 4;

    pub fn new(
        thread_id: ThreadId,
        memory_id: HandleId,
        memory_offset: u64,
        memory_size: u64,
        payload_len: usize,
        compressed: bool,
    ) -> Self {
        let block_type = if compressed {
            BlockType::CompressedMetaData
        } else {
            BlockType::MetaData
        };
        Self {
            meta_header: MetaDataHeader {
                block_header: BlockHeader {
                    block_type,
                    size: (4 + 8 * 4 + payload_len) as u64,
                },
                meta_data_type: MetaDataType::FillMemoryCommand,
            },
            thread_id,
            memory_id,
            memory_offset,
            memory_size,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.meta_header.encode_into(out);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.memory_id.to_le_bytes());
        out.extend_from_slice(&self.memory_offset.to_le_bytes());
        out.extend_from_slice(&self.memory_size.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeWindowCommand {
    pub meta_header: MetaDataHeader,
    pub thread_id: ThreadId,
    pub surface_id: HandleId,
    pub width: u32,
    pub height: u32,
}

impl ResizeWindowCommand {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8 + 8 + 4 + 4;

    pub fn new(thread_id: ThreadId, surface_id: HandleId, width: u32, height: u32) -> Self {
        Self {
            meta_header: MetaDataHeader {
                block_header: BlockHeader {
                    block_type: BlockType::MetaData,
                    size: 4 + 8 + 8 + 4 + 4,
                },
                meta_data_type: MetaDataType::ResizeWindowCommand,
            },
            thread_id,
            surface_id,
            width,
            height,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.meta_header.encode_into(out);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.surface_id.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
    }
}

/// UTF-8 message bytes follow; their length is implied by the block size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayMessageCommandHeader {
    pub meta_header: MetaDataHeader,
    pub thread_id: ThreadId,
}

impl DisplayMessageCommandHeader {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8;

    pub fn new(thread_id: ThreadId, message_len: usize) -> Self {
        Self {
            meta_header: MetaDataHeader {
                block_header: BlockHeader {
                    block_type: BlockType::MetaData,
                    size: (4 + 8 + message_len) as u64,
                },
                meta_data_type: MetaDataType::DisplayMessageCommand,
            },
            thread_id,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.meta_header.encode_into(out);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
    }
}

/// Brackets the resource-initialization section of a state snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeginResourceInitCommand {
    pub meta_header: MetaDataHeader,
    pub thread_id: ThreadId,
    pub device_id: HandleId,
    pub max_resource_size: u64,
    pub max_copy_size: u64,
}

impl BeginResourceInitCommand {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8 * 3 + 8;

    pub fn new(
        thread_id: ThreadId,
        device_id: HandleId,
        max_resource_size: u64,
        max_copy_size: u64,
    ) -> Self {
        Self {
            meta_header: MetaDataHeader {
                block_header: BlockHeader {
                    block_type: BlockType::MetaData,
                    size: 4 + 8 * 4,
                },
                meta_data_type: MetaDataType::BeginResourceInitCommand,
            },
            thread_id,
            device_id,
            max_resource_size,
            max_copy_size,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.meta_header.encode_into(out);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.max_resource_size.to_le_bytes());
        out.extend_from_slice(&self.max_copy_size.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndResourceInitCommand {
    pub meta_header: MetaDataHeader,
    pub thread_id: ThreadId,
    pub device_id: HandleId,
}

impl EndResourceInitCommand {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8 + 8;

    pub fn new(thread_id: ThreadId, device_id: HandleId) -> Self {
        Self {
            meta_header: MetaDataHeader {
                block_header: BlockHeader {
                    block_type: BlockType::MetaData,
                    size: 4 + 8 + 8,
                },
                meta_data_type: MetaDataType::EndResourceInitCommand,
            },
            thread_id,
            device_id,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.meta_header.encode_into(out);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.device_id.to_le_bytes());
    }
}

/// Initial contents of a buffer at snapshot time; `data_size` bytes follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitBufferCommandHeader {
    pub meta_header: MetaDataHeader,
    pub thread_id: ThreadId,
    pub device_id: HandleId,
    pub buffer_id: HandleId,
    pub data_size: u64,
}

impl InitBufferCommandHeader {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8 * 4;

    pub fn new(
        thread_id: ThreadId,
        device_id: HandleId,
        buffer_id: HandleId,
        data_size: u64,
    ) -> Self {
        Self {
            meta_header: MetaDataHeader {
                block_header: BlockHeader {
                    block_type: BlockType::MetaData,
                    size: 4 + 8 * 4 + data_size,
                },
                meta_data_type: MetaDataType::InitBufferCommand,
            },
            thread_id,
            device_id,
            buffer_id,
            data_size,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.meta_header.encode_into(out);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.buffer_id.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
    }
}

/// Initial contents of an image at snapshot time. Followed by `level_count`
/// u64 per-level sizes, then `data_size` bytes of tightly packed level data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitImageCommandHeader {
    pub meta_header: MetaDataHeader,
    pub thread_id: ThreadId,
    pub device_id: HandleId,
    pub image_id: HandleId,
    pub data_size: u64,
    pub aspect: u32,
    pub layout: u32,
    pub level_count: u32,
}

impl InitImageCommandHeader {
    pub const ENCODED_LEN: usize = BLOCK_HEADER_SIZE + 4 + 8 * 4 + 4 * 3;

    pub fn new(
        thread_id: ThreadId,
        device_id: HandleId,
        image_id: HandleId,
        data_size: u64,
        aspect: u32,
        layout: u32,
        level_count: u32,
    ) -> Self {
        Self {
            meta_header: MetaDataHeader {
                block_header: BlockHeader {
                    block_type: BlockType::MetaData,
                    size: 4 + 8 * 4 + 4 * 3 + 8 * level_count as u64 + data_size,
                },
                meta_data_type: MetaDataType::InitImageCommand,
            },
            thread_id,
            device_id,
            image_id,
            data_size,
            aspect,
            layout,
            level_count,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.meta_header.encode_into(out);
        out.extend_from_slice(&self.thread_id.to_le_bytes());
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.image_id.to_le_bytes());
        out.extend_from_slice(&self.data_size.to_le_bytes());
        out.extend_from_slice(&self.aspect.to_le_bytes());
        out.extend_from_slice(&self.layout.to_le_bytes());
        out.extend_from_slice(&self.level_count.to_le_bytes());
    }
}
