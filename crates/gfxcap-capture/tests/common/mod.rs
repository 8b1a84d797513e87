//! Minimal capture-file decoding for assertions. Mirrors the layouts in
//! `gfxcap-format`; parsing is strict so any framing error fails the test.

#![allow(dead_code)]

use std::path::Path;

pub const BLOCK_FUNCTION_CALL: u32 = 1;
pub const BLOCK_COMPRESSED_FUNCTION_CALL: u32 = 2;
pub const BLOCK_META_DATA: u32 = 3;
pub const BLOCK_COMPRESSED_META_DATA: u32 = 4;

pub const META_DISPLAY_MESSAGE: u32 = 1;
pub const META_FILL_MEMORY: u32 = 2;
pub const META_RESIZE_WINDOW: u32 = 3;
pub const META_BEGIN_RESOURCE_INIT: u32 = 5;
pub const META_END_RESOURCE_INIT: u32 = 6;
pub const META_INIT_BUFFER: u32 = 7;
pub const META_INIT_IMAGE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    FunctionCall {
        size: u64,
        call_id: u32,
        thread_id: u64,
        args: Vec<u8>,
    },
    CompressedFunctionCall {
        size: u64,
        call_id: u32,
        thread_id: u64,
        uncompressed_size: u64,
        payload: Vec<u8>,
    },
    MetaData {
        size: u64,
        compressed: bool,
        meta_type: u32,
        body: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillMemory {
    pub thread_id: u64,
    pub memory_id: u64,
    pub offset: u64,
    pub size: u64,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn as_function_call(&self) -> Option<(u32, u64, &[u8])> {
        match self {
            Block::FunctionCall {
                call_id,
                thread_id,
                args,
                ..
            } => Some((*call_id, *thread_id, args)),
            _ => None,
        }
    }

    pub fn meta_type(&self) -> Option<u32> {
        match self {
            Block::MetaData { meta_type, .. } => Some(*meta_type),
            _ => None,
        }
    }

    pub fn as_fill_memory(&self) -> Option<FillMemory> {
        let Block::MetaData {
            meta_type, body, ..
        } = self
        else {
            return None;
        };
        if *meta_type != META_FILL_MEMORY {
            return None;
        }
        assert!(body.len() >= 32, "fill-memory body too short: {}", body.len());
        Some(FillMemory {
            thread_id: read_u64(body, 0),
            memory_id: read_u64(body, 8),
            offset: read_u64(body, 16),
            size: read_u64(body, 24),
            payload: body[32..].to_vec(),
        })
    }
}

#[derive(Debug)]
pub struct ParsedCapture {
    pub options: Vec<(u32, u32)>,
    pub blocks: Vec<Block>,
}

impl ParsedCapture {
    pub fn function_calls(&self) -> Vec<(u32, u64, &[u8])> {
        self.blocks
            .iter()
            .filter_map(Block::as_function_call)
            .collect()
    }

    pub fn fill_memory_commands(&self) -> Vec<FillMemory> {
        self.blocks.iter().filter_map(Block::as_fill_memory).collect()
    }
}

pub fn read_capture(path: &Path) -> ParsedCapture {
    let bytes = std::fs::read(path).unwrap_or_else(|err| panic!("reading {path:?}: {err}"));
    parse_capture(&bytes)
}

pub fn parse_capture(bytes: &[u8]) -> ParsedCapture {
    let mut at = 0;

    assert_eq!(&bytes[0..4], b"GCAP", "bad fourcc");
    let _major = read_u16(bytes, 4);
    let _minor = read_u16(bytes, 6);
    let num_options = read_u32(bytes, 8);
    at += 12;

    let mut options = Vec::new();
    for _ in 0..num_options {
        options.push((read_u32(bytes, at), read_u32(bytes, at + 4)));
        at += 8;
    }

    let mut blocks = Vec::new();
    while at < bytes.len() {
        let block_type = read_u32(bytes, at);
        let size = read_u64(bytes, at + 4);
        at += 12;
        let end = at + size as usize;
        assert!(end <= bytes.len(), "block overruns the file");

        let block = match block_type {
            BLOCK_FUNCTION_CALL => {
                let call_id = read_u32(bytes, at);
                let thread_id = read_u64(bytes, at + 4);
                Block::FunctionCall {
                    size,
                    call_id,
                    thread_id,
                    args: bytes[at + 12..end].to_vec(),
                }
            }
            BLOCK_COMPRESSED_FUNCTION_CALL => {
                let call_id = read_u32(bytes, at);
                let thread_id = read_u64(bytes, at + 4);
                let uncompressed_size = read_u64(bytes, at + 12);
                Block::CompressedFunctionCall {
                    size,
                    call_id,
                    thread_id,
                    uncompressed_size,
                    payload: bytes[at + 20..end].to_vec(),
                }
            }
            BLOCK_META_DATA | BLOCK_COMPRESSED_META_DATA => Block::MetaData {
                size,
                compressed: block_type == BLOCK_COMPRESSED_META_DATA,
                meta_type: read_u32(bytes, at),
                body: bytes[at + 4..end].to_vec(),
            },
            other => panic!("unknown block type {other}"),
        };
        blocks.push(block);
        at = end;
    }

    ParsedCapture { options, blocks }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}
