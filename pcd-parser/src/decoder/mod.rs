use std::path::Path;

use pcd_core::pointcloud::{field_mask::FieldMask, header::Header, point::Point};

use crate::error::ReaderError;

pub mod csv;
pub mod las;

pub use self::csv::CsvDecoder;
pub use self::las::LasDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Las,
    Laz,
    Csv,
    Txt,
}

/// Unknown extensions are read as delimited text.
pub fn get_extension(extension: &str) -> Extension {
    match extension.to_ascii_lowercase().as_str() {
        "las" => Extension::Las,
        "laz" => Extension::Laz,
        "csv" => Extension::Csv,
        _ => Extension::Txt,
    }
}

impl Extension {
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(get_extension)
            .unwrap_or(Extension::Txt)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Extension::Csv | Extension::Txt)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions {
    /// Scan text sources once at open to fill in counts, bounds and quantization.
    pub populate_header: bool,
    /// Read buffer size in bytes; zero keeps the library default.
    pub io_buffer_size: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            populate_header: true,
            io_buffer_size: 0,
        }
    }
}

impl DecoderOptions {
    pub(crate) fn buffer_capacity(&self) -> usize {
        if self.io_buffer_size == 0 {
            64 * 1024
        } else {
            self.io_buffer_size
        }
    }
}

/// Produces raw points of one source format.
pub trait PointDecoder {
    fn format(&self) -> Extension;

    fn header(&self) -> &Header;

    /// Fills `point` with the next record; `Ok(false)` at the end of the source.
    fn read_point(&mut self, point: &mut Point) -> Result<bool, ReaderError>;

    /// Index of the record the next `read_point` returns.
    fn position(&self) -> u64;

    fn seek(&mut self, index: u64) -> Result<(), ReaderError>;

    /// Rewinds to the first record.
    fn reopen(&mut self) -> Result<(), ReaderError>;

    fn close(&mut self);

    fn can_seek(&self) -> bool {
        true
    }

    /// Fields the consumers need; decoders may materialize more.
    fn set_decompress_selective(&mut self, _mask: FieldMask) {}

    fn path(&self) -> Option<&Path>;
}

pub fn open_decoder(
    path: &Path,
    options: &DecoderOptions,
) -> Result<Box<dyn PointDecoder>, ReaderError> {
    let decoder: Box<dyn PointDecoder> = match Extension::from_path(path) {
        Extension::Las | Extension::Laz => Box::new(LasDecoder::open(path, options)?),
        Extension::Csv | Extension::Txt => Box::new(CsvDecoder::open(path, options)?),
    };
    log::debug!(
        "opened {:?} as {:?} with {} points",
        path,
        decoder.format(),
        decoder.header().point_count
    );
    Ok(decoder)
}

/// Reads only the header of `path`.
pub fn read_header(path: &Path, options: &DecoderOptions) -> Result<Header, ReaderError> {
    let mut decoder = open_decoder(path, options)?;
    let header = decoder.header().clone();
    decoder.close();
    Ok(header)
}
