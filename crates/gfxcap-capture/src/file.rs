//! The append-only capture file sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use gfxcap_format::{
    CompressionType, FileHeader, FileOption, FileOptionPair, FILE_HEADER_SIZE,
    FILE_OPTION_PAIR_SIZE,
};

use crate::error::{CaptureError, Result};

/// Owns the output sink and the running byte counter. One writer exists per
/// open capture file; every access happens under the manager's file lock.
pub(crate) struct CaptureFileWriter {
    sink: Box<dyn Write + Send>,
    bytes_written: u64,
}

impl CaptureFileWriter {
    /// Creates `path` and emits the file header and option table. The first
    /// option is always the compression type.
    pub fn create(path: &str, compression: CompressionType) -> Result<Self> {
        let file = File::create(path).map_err(|source| CaptureError::FileCreate {
            path: path.to_owned(),
            source,
        })?;
        Self::from_sink(Box::new(BufWriter::new(file)), compression)
    }

    pub fn from_sink(sink: Box<dyn Write + Send>, compression: CompressionType) -> Result<Self> {
        let mut writer = Self {
            sink,
            bytes_written: 0,
        };
        writer.write_file_header(compression)?;
        Ok(writer)
    }

    fn write_file_header(&mut self, compression: CompressionType) -> Result<()> {
        let options = [FileOptionPair {
            option_id: FileOption::CompressionType,
            option_value: compression as u32,
        }];

        let mut bytes =
            Vec::with_capacity(FILE_HEADER_SIZE + options.len() * FILE_OPTION_PAIR_SIZE);
        FileHeader::new(options.len() as u32).encode_into(&mut bytes);
        for option in &options {
            option.encode_into(&mut bytes);
        }

        self.sink.write_all(&bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Appends one header + payload pair.
    pub fn write_block(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        self.sink.write_all(header)?;
        if !payload.is_empty() {
            self.sink.write_all(payload)?;
        }
        self.bytes_written += (header.len() + payload.len()) as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_option_table_are_emitted_on_open() {
        let writer =
            CaptureFileWriter::from_sink(Box::new(Vec::new()), CompressionType::Zlib).unwrap();
        assert_eq!(
            writer.bytes_written(),
            (FILE_HEADER_SIZE + FILE_OPTION_PAIR_SIZE) as u64
        );
    }

    #[test]
    fn block_writes_advance_the_counter() {
        let mut writer =
            CaptureFileWriter::from_sink(Box::new(Vec::new()), CompressionType::None).unwrap();
        let before = writer.bytes_written();
        writer.write_block(&[0u8; 24], &[1, 2, 3]).unwrap();
        assert_eq!(writer.bytes_written(), before + 27);
    }
}
