//! On-disk format of gfxcap capture files.
//!
//! A capture file is a fixed [`FileHeader`] and option table followed by a
//! sequence of framed blocks. Every block starts with a [`BlockHeader`] whose
//! `size` field counts the bytes that follow the header, so a reader can skip
//! blocks it does not understand. All integers are little-endian.

#![forbid(unsafe_code)]

mod format;

pub use format::*;
