use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use byteorder::{ByteOrder, LittleEndian};
use las::{point::ScanDirection, Reader};
use pcd_core::pointcloud::{
    field_mask::FieldMask,
    header::{AttributeDescriptor, BoundingVolume, Header, RETURN_SLOTS},
    point::{Color, Point, PointFlags, WavePacket},
    quantize::Quantizer,
};

use super::{DecoderOptions, Extension, PointDecoder};
use crate::error::ReaderError;

const EXTRA_BYTES_USER_ID: &str = "LASF_Spec";
const EXTRA_BYTES_RECORD_ID: u16 = 4;
const EXTRA_BYTES_DESCRIPTOR_LEN: usize = 192;

/// Decodes LAS and LAZ files.
pub struct LasDecoder {
    path: PathBuf,
    format: Extension,
    reader: Option<Reader>,
    header: Header,
    position: u64,
    selective: FieldMask,
    io_buffer_size: usize,
}

impl LasDecoder {
    pub fn open(path: &Path, options: &DecoderOptions) -> Result<Self, ReaderError> {
        let reader = Self::open_reader(path, options.buffer_capacity())?;
        let header = convert_header(reader.header())?;
        Ok(Self {
            path: path.to_path_buf(),
            format: Extension::from_path(path),
            reader: Some(reader),
            header,
            position: 0,
            selective: FieldMask::all(),
            io_buffer_size: options.buffer_capacity(),
        })
    }

    fn open_reader(path: &Path, capacity: usize) -> Result<Reader, ReaderError> {
        let file = File::open(path)?;
        let reader = Reader::new(BufReader::with_capacity(capacity, file))?;
        Ok(reader)
    }

    fn convert_las_point(&self, las_point: las::Point, point: &mut Point) {
        let quantizer = self.header.quantizer;
        point.quantizer = quantizer;
        [point.x, point.y, point.z] = quantizer.quantize([las_point.x, las_point.y, las_point.z]);

        point.color = las_point.color.map(|c| Color {
            r: c.red,
            g: c.green,
            b: c.blue,
        });

        let mut flags = PointFlags::empty();
        flags.set(PointFlags::SYNTHETIC, las_point.is_synthetic);
        flags.set(PointFlags::KEYPOINT, las_point.is_key_point);
        flags.set(PointFlags::WITHHELD, las_point.is_withheld);
        flags.set(PointFlags::OVERLAP, las_point.is_overlap);
        flags.set(
            PointFlags::SCAN_DIRECTION,
            las_point.scan_direction == ScanDirection::LeftToRight,
        );
        flags.set(
            PointFlags::EDGE_OF_FLIGHTLINE,
            las_point.is_edge_of_flight_line,
        );

        let attributes = &mut point.attributes;
        attributes.intensity = las_point.intensity;
        attributes.return_number = las_point.return_number;
        attributes.number_of_returns = las_point.number_of_returns;
        attributes.classification = u8::from(las_point.classification);
        attributes.scanner_channel = las_point.scanner_channel;
        attributes.flags = flags;
        attributes.scan_angle = las_point.scan_angle;
        attributes.user_data = las_point.user_data;
        attributes.point_source_id = las_point.point_source_id;
        attributes.gps_time = las_point.gps_time;
        attributes.nir = las_point.nir;
        attributes.wave_packet = las_point.waveform.map(|w| WavePacket {
            descriptor_index: w.wave_packet_descriptor_index,
            byte_offset: w.byte_offset_to_waveform_data,
            packet_size: w.waveform_packet_size_in_bytes,
            return_point: w.return_point_waveform_location,
            dx: w.x_t,
            dy: w.y_t,
            dz: w.z_t,
        });

        attributes.extra.clear();
        if self.selective.needs_extra_bytes() && !self.header.attributes.is_empty() {
            decode_extra_bytes(
                &self.header.attributes,
                &las_point.extra_bytes,
                &mut attributes.extra,
            );
        }
    }
}

impl PointDecoder for LasDecoder {
    fn format(&self) -> Extension {
        self.format
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn read_point(&mut self, point: &mut Point) -> Result<bool, ReaderError> {
        let reader = self.reader.as_mut().ok_or(ReaderError::Closed)?;
        let next = reader.points().next();
        match next {
            Some(Ok(las_point)) => {
                self.position += 1;
                self.convert_las_point(las_point, point);
                Ok(true)
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(false),
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        if index > self.header.point_count {
            return Err(ReaderError::SeekOutOfRange {
                index,
                count: self.header.point_count,
            });
        }
        let reader = self.reader.as_mut().ok_or(ReaderError::Closed)?;
        reader.seek(index)?;
        self.position = index;
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        match self.reader.as_mut() {
            Some(reader) => reader.seek(0)?,
            None => self.reader = Some(Self::open_reader(&self.path, self.io_buffer_size)?),
        }
        self.position = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn set_decompress_selective(&mut self, mask: FieldMask) {
        self.selective = mask;
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

fn convert_header(las_header: &las::Header) -> Result<Header, ReaderError> {
    let transforms = las_header.transforms();
    let quantizer = Quantizer::new(
        [
            transforms.x.scale,
            transforms.y.scale,
            transforms.z.scale,
        ],
        [
            transforms.x.offset,
            transforms.y.offset,
            transforms.z.offset,
        ],
    );

    let bounds = las_header.bounds();
    let mut point_count_by_return = [0; RETURN_SLOTS];
    for (slot, count) in point_count_by_return.iter_mut().enumerate() {
        *count = las_header
            .number_of_points_by_return(slot as u8 + 1)
            .unwrap_or(0);
    }

    let format = las_header.point_format();
    let mut header = Header {
        file_source_id: las_header.file_source_id(),
        point_format: format.to_u8()?,
        point_record_length: format.len(),
        point_count: las_header.number_of_points(),
        point_count_by_return,
        quantizer,
        bounds: BoundingVolume {
            min: [bounds.min.x, bounds.min.y, bounds.min.z],
            max: [bounds.max.x, bounds.max.y, bounds.max.z],
        },
        attributes: Vec::new(),
    };

    for vlr in las_header.vlrs() {
        if vlr.user_id == EXTRA_BYTES_USER_ID && vlr.record_id == EXTRA_BYTES_RECORD_ID {
            for descriptor in parse_extra_bytes_descriptors(&vlr.data) {
                if header.add_attribute(descriptor).is_none() {
                    break;
                }
            }
        }
    }
    Ok(header)
}

fn parse_fixed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

/// Parses the descriptors of an extra-bytes VLR. Descriptors with a multi-value
/// data type end the list since the byte layout after them is unknown.
pub(crate) fn parse_extra_bytes_descriptors(data: &[u8]) -> Vec<AttributeDescriptor> {
    let mut descriptors = Vec::new();
    for chunk in data.chunks_exact(EXTRA_BYTES_DESCRIPTOR_LEN) {
        let data_type = chunk[2];
        let options = chunk[3];
        let size = match data_type {
            0 => options as usize,
            t => match AttributeDescriptor::size_of_type(t) {
                Some(size) => size,
                None => {
                    log::warn!("unsupported extra bytes data type {}", t);
                    break;
                }
            },
        };

        let read_value = |offset: usize| -> f64 {
            match data_type {
                9 | 10 => LittleEndian::read_f64(&chunk[offset..]),
                2 | 4 | 6 | 8 => LittleEndian::read_i64(&chunk[offset..]) as f64,
                _ => LittleEndian::read_u64(&chunk[offset..]) as f64,
            }
        };

        let has_options = data_type != 0;
        let descriptor = AttributeDescriptor {
            name: parse_fixed_string(&chunk[4..36]),
            data_type,
            size,
            no_data: (has_options && options & 0x01 != 0).then(|| read_value(40)),
            scale: if has_options && options & 0x08 != 0 {
                LittleEndian::read_f64(&chunk[112..])
            } else {
                1.0
            },
            offset: if has_options && options & 0x10 != 0 {
                LittleEndian::read_f64(&chunk[136..])
            } else {
                0.0
            },
            description: parse_fixed_string(&chunk[160..192]),
        };
        descriptors.push(descriptor);
    }
    descriptors
}

/// Decodes the extra bytes of one record into scaled values; opaque attributes decode as NaN.
pub(crate) fn decode_extra_bytes(
    descriptors: &[AttributeDescriptor],
    bytes: &[u8],
    values: &mut Vec<f64>,
) {
    let mut offset = 0;
    for descriptor in descriptors {
        let end = offset + descriptor.size;
        if end > bytes.len() {
            break;
        }
        let raw = &bytes[offset..end];
        let value = match descriptor.data_type {
            1 => raw[0] as f64,
            2 => raw[0] as i8 as f64,
            3 => LittleEndian::read_u16(raw) as f64,
            4 => LittleEndian::read_i16(raw) as f64,
            5 => LittleEndian::read_u32(raw) as f64,
            6 => LittleEndian::read_i32(raw) as f64,
            7 => LittleEndian::read_u64(raw) as f64,
            8 => LittleEndian::read_i64(raw) as f64,
            9 => LittleEndian::read_f32(raw) as f64,
            10 => LittleEndian::read_f64(raw),
            _ => f64::NAN,
        };
        values.push(value * descriptor.scale + descriptor.offset);
        offset = end;
    }
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;

    use super::*;

    fn descriptor_bytes(name: &str, data_type: u8, options: u8, scale: f64, offset: f64) -> Vec<u8> {
        let mut bytes = vec![0u8; EXTRA_BYTES_DESCRIPTOR_LEN];
        bytes[2] = data_type;
        bytes[3] = options;
        bytes[4..4 + name.len()].copy_from_slice(name.as_bytes());
        let mut scale_bytes = Vec::new();
        scale_bytes.write_f64::<LittleEndian>(scale).unwrap();
        bytes[112..120].copy_from_slice(&scale_bytes);
        let mut offset_bytes = Vec::new();
        offset_bytes.write_f64::<LittleEndian>(offset).unwrap();
        bytes[136..144].copy_from_slice(&offset_bytes);
        bytes
    }

    #[test]
    fn parses_descriptors_and_values() {
        let mut data = descriptor_bytes("height", 4, 0x08 | 0x10, 0.01, 100.0);
        data.extend(descriptor_bytes("echo", 1, 0, 0.0, 0.0));
        let descriptors = parse_extra_bytes_descriptors(&data);

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].name, "height");
        assert_eq!(descriptors[0].size, 2);
        assert_eq!(descriptors[1].scale, 1.0);

        let mut record = Vec::new();
        record.write_i16::<LittleEndian>(-250).unwrap();
        record.write_u8(7).unwrap();
        let mut values = Vec::new();
        decode_extra_bytes(&descriptors, &record, &mut values);
        assert_eq!(values.len(), 2);
        assert!((values[0] - 97.5).abs() < 1e-9);
        assert_eq!(values[1], 7.0);
    }

    #[test]
    fn short_records_decode_partially() {
        let data = descriptor_bytes("intensity2", 5, 0, 1.0, 0.0);
        let descriptors = parse_extra_bytes_descriptors(&data);
        let mut values = Vec::new();
        decode_extra_bytes(&descriptors, &[1, 2], &mut values);
        assert!(values.is_empty());
    }

    #[test]
    fn unknown_type_ends_the_table() {
        let mut data = descriptor_bytes("a", 9, 0, 1.0, 0.0);
        data.extend(descriptor_bytes("b", 25, 0, 1.0, 0.0));
        data.extend(descriptor_bytes("c", 1, 0, 1.0, 0.0));
        assert_eq!(parse_extra_bytes_descriptors(&data).len(), 1);
    }
}
