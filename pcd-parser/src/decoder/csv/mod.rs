use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use ::csv::{ReaderBuilder, StringRecord};
use pcd_core::pointcloud::{
    field_mask::FieldMask,
    header::{AttributeDescriptor, BoundingVolume, Header, RETURN_SLOTS},
    point::{Color, Point, PointFlags},
    quantize::Quantizer,
};

use super::{DecoderOptions, Extension, PointDecoder};
use crate::error::ReaderError;

const ATTRIBUTE_NAMES: [&str; 24] = [
    "x",
    "y",
    "z",
    "intensity",
    "return_number",
    "number_of_returns",
    "classification",
    "scanner_channel",
    "scan_angle",
    "user_data",
    "point_source_id",
    "gps_time",
    "r",
    "g",
    "b",
    "red",
    "green",
    "blue",
    "nir",
    "withheld",
    "synthetic",
    "keypoint",
    "overlap",
    "scan_direction",
];

fn normalize(name: &str) -> String {
    name.trim().to_lowercase().replace(['_', '-', ' '], "")
}

/// Columns of a text source: known point fields plus extra attributes.
#[derive(Debug, Clone, Default)]
struct FieldMapping {
    fields: HashMap<&'static str, usize>,
    extra: Vec<usize>,
}

fn create_field_mapping(
    headers: Option<&StringRecord>,
    header: &mut Header,
) -> Result<FieldMapping, ReaderError> {
    let mut mapping = FieldMapping::default();

    match headers {
        Some(headers) => {
            for (index, column) in headers.iter().enumerate() {
                let normalized = normalize(column);
                let known = ATTRIBUTE_NAMES
                    .iter()
                    .find(|name| normalize(name) == normalized);
                match known {
                    Some(name) => {
                        mapping.fields.insert(name, index);
                    }
                    None if !normalized.is_empty() => {
                        let descriptor = AttributeDescriptor::new(column.trim(), 10);
                        if header.add_attribute(descriptor).is_some() {
                            mapping.extra.push(index);
                        }
                    }
                    None => {}
                }
            }
        }
        None => {
            for (index, name) in ATTRIBUTE_NAMES.iter().take(3).enumerate() {
                mapping.fields.insert(name, index);
            }
        }
    }

    for name in ["x", "y", "z"] {
        if !mapping.fields.contains_key(name) {
            return Err(ReaderError::MissingField(name));
        }
    }

    Ok(mapping)
}

fn get_field_value<'a>(
    record: &'a StringRecord,
    mapping: &FieldMapping,
    field_name: &str,
) -> Option<&'a str> {
    mapping
        .fields
        .get(field_name)
        .and_then(|&index| record.get(index))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_optional_field<T: std::str::FromStr>(
    record: &StringRecord,
    mapping: &FieldMapping,
    field_name: &str,
) -> Result<Option<T>, String> {
    match get_field_value(record, mapping, field_name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid value '{}' for {}", value, field_name)),
        None => Ok(None),
    }
}

/// Integers written as floats ("2.0") are accepted for integer fields, values
/// that do not fit `T` are an error.
fn parse_integer_field<T: TryFrom<i64>>(
    record: &StringRecord,
    mapping: &FieldMapping,
    field_name: &str,
) -> Result<Option<T>, String> {
    let Some(value) = parse_optional_field::<f64>(record, mapping, field_name)? else {
        return Ok(None);
    };
    let floored = value.floor();
    if floored.is_finite() {
        if let Ok(value) = T::try_from(floored as i64) {
            return Ok(Some(value));
        }
    }
    Err(format!("value {} is out of range for {}", value, field_name))
}

fn parse_coordinates(record: &StringRecord, mapping: &FieldMapping) -> Result<[f64; 3], String> {
    let mut coordinates = [0.0; 3];
    for (axis, name) in ["x", "y", "z"].into_iter().enumerate() {
        coordinates[axis] = parse_optional_field::<f64>(record, mapping, name)?
            .ok_or_else(|| format!("missing '{}' field", name))?;
    }
    Ok(coordinates)
}

fn parse_point(
    record: &StringRecord,
    mapping: &FieldMapping,
    quantizer: &Quantizer,
    selective: FieldMask,
    point: &mut Point,
) -> Result<(), String> {
    let coordinates = parse_coordinates(record, mapping)?;
    point.quantizer = *quantizer;
    point.set_coordinates(coordinates);

    let word = |name: &str| parse_integer_field::<u16>(record, mapping, name);
    let byte = |name: &str| parse_integer_field::<u8>(record, mapping, name);

    let color = match (
        word("r")?.or(word("red")?),
        word("g")?.or(word("green")?),
        word("b")?.or(word("blue")?),
    ) {
        (Some(r), Some(g), Some(b)) => Some(Color { r, g, b }),
        _ => None,
    };
    point.color = color;

    let mut flags = PointFlags::empty();
    for (name, flag) in [
        ("withheld", PointFlags::WITHHELD),
        ("synthetic", PointFlags::SYNTHETIC),
        ("keypoint", PointFlags::KEYPOINT),
        ("overlap", PointFlags::OVERLAP),
        ("scan_direction", PointFlags::SCAN_DIRECTION),
    ] {
        flags.set(flag, byte(name)?.unwrap_or(0) != 0);
    }

    let attributes = &mut point.attributes;
    attributes.flags = flags;
    attributes.intensity = word("intensity")?.unwrap_or(0);
    attributes.return_number = byte("return_number")?.unwrap_or(1);
    attributes.number_of_returns = byte("number_of_returns")?.unwrap_or(1);
    attributes.classification = byte("classification")?.unwrap_or(0);
    attributes.scanner_channel = byte("scanner_channel")?.unwrap_or(0);
    attributes.scan_angle = parse_optional_field::<f32>(record, mapping, "scan_angle")?.unwrap_or(0.0);
    attributes.user_data = byte("user_data")?.unwrap_or(0);
    attributes.point_source_id = word("point_source_id")?.unwrap_or(0);
    attributes.gps_time = parse_optional_field::<f64>(record, mapping, "gps_time")?;
    attributes.nir = word("nir")?;
    attributes.wave_packet = None;

    attributes.extra.clear();
    if selective.needs_extra_bytes() {
        for &index in &mapping.extra {
            let value = record
                .get(index)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| v.parse::<f64>().unwrap_or(f64::NAN))
                .unwrap_or(f64::NAN);
            attributes.extra.push(value);
        }
    }
    Ok(())
}

fn detect_delimiter(first_line: &str) -> u8 {
    [b',', b'\t', b';']
        .into_iter()
        .find(|&d| first_line.as_bytes().contains(&d))
        .unwrap_or(b' ')
}

fn is_data_row(record: &StringRecord) -> bool {
    record.len() >= 3
        && record
            .iter()
            .filter(|v| !v.trim().is_empty())
            .all(|v| v.trim().parse::<f64>().is_ok())
}

const MIN_DIGITS: usize = 2;
const MAX_DIGITS: usize = 7;

/// Significant fractional digits of a decimal literal.
fn fractional_digits(value: &str) -> usize {
    match value.trim().split_once('.') {
        Some((_, fraction)) => fraction
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .trim_end_matches('0')
            .len(),
        None => 0,
    }
}

fn scale_for_digits(digits: usize) -> f64 {
    format!("1e-{}", digits.clamp(MIN_DIGITS, MAX_DIGITS))
        .parse()
        .unwrap_or(0.01)
}

/// Per-axis scale from the finest fractional precision seen. Boxes that look like
/// longitude/latitude always keep seven decimals in x and y.
fn scale_from_digits(digits: [usize; 3], bounds: &BoundingVolume) -> [f64; 3] {
    let geographic = !bounds.is_empty()
        && -360.0 < bounds.min[0]
        && -360.0 < bounds.min[1]
        && bounds.max[0] < 360.0
        && bounds.max[1] < 360.0;
    let xy = |digits: usize| {
        if geographic {
            MAX_DIGITS
        } else {
            digits
        }
    };
    [
        scale_for_digits(xy(digits[0])),
        scale_for_digits(xy(digits[1])),
        scale_for_digits(digits[2]),
    ]
}

fn record_digits(record: &StringRecord, mapping: &FieldMapping, digits: &mut [usize; 3]) {
    for (axis, name) in ["x", "y", "z"].into_iter().enumerate() {
        if let Some(value) = get_field_value(record, mapping, name) {
            digits[axis] = digits[axis].max(fractional_digits(value));
        }
    }
}

#[derive(Debug, Clone)]
enum TextSource {
    File(PathBuf),
    Stdin,
}

/// Decodes delimited text (CSV, TXT, XYZ and similar).
pub struct CsvDecoder {
    source: TextSource,
    reader: Option<::csv::Reader<Box<dyn Read>>>,
    mapping: FieldMapping,
    header: Header,
    record: StringRecord,
    pending: Option<StringRecord>,
    position: u64,
    selective: FieldMask,
    options: DecoderOptions,
    format: Extension,
}

impl CsvDecoder {
    pub fn open(path: &Path, options: &DecoderOptions) -> Result<Self, ReaderError> {
        let mut decoder = Self::new(TextSource::File(path.to_path_buf()), options);
        decoder.start()?;
        if options.populate_header {
            decoder.populate_header()?;
        } else {
            decoder.guess_quantizer()?;
        }
        Ok(decoder)
    }

    /// Streams points from stdin. The source can neither seek nor reopen.
    pub fn from_stdin(options: &DecoderOptions) -> Result<Self, ReaderError> {
        let mut decoder = Self::new(TextSource::Stdin, options);
        decoder.start()?;
        decoder.guess_quantizer()?;
        Ok(decoder)
    }

    fn new(source: TextSource, options: &DecoderOptions) -> Self {
        let format = match &source {
            TextSource::File(path) => Extension::from_path(path),
            TextSource::Stdin => Extension::Txt,
        };
        Self {
            source,
            reader: None,
            mapping: FieldMapping::default(),
            header: Header::default(),
            record: StringRecord::new(),
            pending: None,
            position: 0,
            selective: FieldMask::all(),
            options: *options,
            format,
        }
    }

    fn source_name(&self) -> String {
        match &self.source {
            TextSource::File(path) => path.display().to_string(),
            TextSource::Stdin => "stdin".to_string(),
        }
    }

    fn format_error(&self, message: String) -> ReaderError {
        ReaderError::Format {
            path: self.source_name(),
            message: format!("record {}: {}", self.position + 1, message),
        }
    }

    /// Opens the underlying reader and consumes the column header, if any.
    fn start(&mut self) -> Result<(), ReaderError> {
        let mut buffered: Box<dyn BufRead> = match &self.source {
            TextSource::File(path) => Box::new(BufReader::with_capacity(
                self.options.buffer_capacity(),
                File::open(path)?,
            )),
            TextSource::Stdin => Box::new(BufReader::with_capacity(
                self.options.buffer_capacity(),
                io::stdin(),
            )),
        };
        let delimiter = {
            let peeked = buffered.fill_buf()?;
            let line_end = peeked
                .iter()
                .position(|&b| b == b'\n')
                .unwrap_or(peeked.len());
            detect_delimiter(&String::from_utf8_lossy(&peeked[..line_end]))
        };
        let read: Box<dyn Read> = Box::new(buffered);

        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .delimiter(delimiter)
            .flexible(true)
            .comment(Some(b'#'))
            .from_reader(read);

        let mut first = StringRecord::new();
        let has_first = reader.read_record(&mut first)?;

        let mut header = Header::default();
        let (mapping, pending) = if has_first && !is_data_row(&first) {
            (create_field_mapping(Some(&first), &mut header)?, None)
        } else {
            let pending = has_first.then_some(first);
            (create_field_mapping(None, &mut header)?, pending)
        };

        self.header.attributes = header.attributes;
        self.mapping = mapping;
        self.pending = pending;
        self.reader = Some(reader);
        self.position = 0;
        Ok(())
    }

    fn next_record(&mut self) -> Result<bool, ReaderError> {
        if let Some(pending) = self.pending.take() {
            self.record = pending;
            return Ok(true);
        }
        let reader = self.reader.as_mut().ok_or(ReaderError::Closed)?;
        Ok(reader.read_record(&mut self.record)?)
    }

    /// Reads the whole source once to fill in counts, bounds, scale and offset.
    pub fn populate_header(&mut self) -> Result<(), ReaderError> {
        if !self.can_seek() {
            return Err(ReaderError::NotSeekable);
        }
        let mut bounds = BoundingVolume::empty();
        let mut by_return = [0u64; RETURN_SLOTS];
        let mut digits = [0; 3];
        while self.next_record()? {
            record_digits(&self.record, &self.mapping, &mut digits);
            let coordinates = parse_coordinates(&self.record, &self.mapping)
                .map_err(|message| self.format_error(message))?;
            bounds.extend(coordinates);
            let return_number =
                parse_integer_field::<u8>(&self.record, &self.mapping, "return_number")
                    .map_err(|message| self.format_error(message))?
                    .unwrap_or(1);
            if (1..=RETURN_SLOTS).contains(&(return_number as usize)) {
                by_return[return_number as usize - 1] += 1;
            }
            self.position += 1;
        }

        self.header.quantizer = Self::choose_quantizer(digits, &bounds);
        self.header.reset_statistics();
        self.header.point_count = self.position;
        self.header.point_count_by_return = by_return;
        self.header.bounds = bounds;
        self.header.snap_bounds();
        self.start()
    }

    /// Picks a quantizer from the first record only; bounds stay unknown.
    fn guess_quantizer(&mut self) -> Result<(), ReaderError> {
        if self.pending.is_none() && self.next_record()? {
            self.pending = Some(self.record.clone());
        }
        if let Some(first) = &self.pending {
            let coordinates = parse_coordinates(first, &self.mapping)
                .map_err(|message| self.format_error(message))?;
            let mut bounds = BoundingVolume::empty();
            bounds.extend(coordinates);
            let mut digits = [0; 3];
            record_digits(first, &self.mapping, &mut digits);
            self.header.quantizer = Self::choose_quantizer(digits, &bounds);
        }
        self.header.reset_statistics();
        Ok(())
    }

    fn choose_quantizer(digits: [usize; 3], bounds: &BoundingVolume) -> Quantizer {
        let scale = scale_from_digits(digits, bounds);
        let quantizer = Quantizer::new(scale, [0.0; 3]);
        Quantizer::new(scale, quantizer.auto_offset(bounds))
    }
}

impl PointDecoder for CsvDecoder {
    fn format(&self) -> Extension {
        self.format
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn read_point(&mut self, point: &mut Point) -> Result<bool, ReaderError> {
        if !self.next_record()? {
            return Ok(false);
        }
        parse_point(
            &self.record,
            &self.mapping,
            &self.header.quantizer,
            self.selective,
            point,
        )
        .map_err(|message| self.format_error(message))?;
        self.position += 1;
        Ok(true)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        if !self.can_seek() {
            return Err(ReaderError::NotSeekable);
        }
        if self.header.point_count > 0 && index > self.header.point_count {
            return Err(ReaderError::SeekOutOfRange {
                index,
                count: self.header.point_count,
            });
        }
        if index < self.position {
            self.reopen()?;
        }
        while self.position < index {
            if !self.next_record()? {
                return Err(ReaderError::SeekOutOfRange {
                    index,
                    count: self.position,
                });
            }
            self.position += 1;
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        if !self.can_seek() {
            return Err(ReaderError::NotSeekable);
        }
        let attributes = std::mem::take(&mut self.header.attributes);
        self.start()?;
        if self.header.attributes.is_empty() {
            self.header.attributes = attributes;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
        self.pending = None;
    }

    fn can_seek(&self) -> bool {
        matches!(self.source, TextSource::File(_))
    }

    fn set_decompress_selective(&mut self, mask: FieldMask) {
        self.selective = mask;
    }

    fn path(&self) -> Option<&Path> {
        match &self.source {
            TextSource::File(path) => Some(path),
            TextSource::Stdin => None,
        }
    }
}
