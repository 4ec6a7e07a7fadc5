use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use clap::ValueEnum;
use pcd_core::pointcloud::{header::Header, point::Point, point::PointFlags};
use pcd_parser::reader::PointSink;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Csv,
    /// One JSON object per line.
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "jsonl",
        }
    }
}

const COLUMNS: [&str; 18] = [
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
    "red",
    "green",
    "blue",
    "nir",
    "withheld",
    "synthetic",
];

/// Writes delivered points as delimited text with a header row.
pub struct CsvSink {
    writer: csv::Writer<Box<dyn Write>>,
}

impl CsvSink {
    pub fn new(writer: Box<dyn Write>) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl PointSink for CsvSink {
    fn begin(&mut self, header: &Header) -> io::Result<()> {
        let extra = header.attributes.iter().map(|a| a.name.as_str());
        self.writer
            .write_record(COLUMNS.iter().copied().chain(extra))
            .map_err(io::Error::other)
    }

    fn write_point(&mut self, point: &Point) -> io::Result<()> {
        let a = &point.attributes;
        let color = point.color;
        let mut record = vec![
            point.get_x().to_string(),
            point.get_y().to_string(),
            point.get_z().to_string(),
            a.intensity.to_string(),
            a.return_number.to_string(),
            a.number_of_returns.to_string(),
            a.classification.to_string(),
            a.scanner_channel.to_string(),
            a.scan_angle.to_string(),
            a.user_data.to_string(),
            a.point_source_id.to_string(),
            optional(a.gps_time),
            optional(color.map(|c| c.r)),
            optional(color.map(|c| c.g)),
            optional(color.map(|c| c.b)),
            optional(a.nir),
            u8::from(a.flags.contains(PointFlags::WITHHELD)).to_string(),
            u8::from(a.flags.contains(PointFlags::SYNTHETIC)).to_string(),
        ];
        record.extend(a.extra.iter().map(|v| v.to_string()));
        self.writer.write_record(&record).map_err(io::Error::other)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Serialize)]
struct PointRecord<'a> {
    x: f64,
    y: f64,
    z: f64,
    intensity: u16,
    return_number: u8,
    number_of_returns: u8,
    classification: u8,
    point_source_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    gps_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rgb: Option<[u16; 3]>,
    flags: u8,
    #[serde(skip_serializing_if = "no_extra")]
    extra: &'a [f64],
}

fn no_extra(extra: &&[f64]) -> bool {
    extra.is_empty()
}

/// Writes delivered points as JSON lines.
pub struct JsonLinesSink {
    writer: Box<dyn Write>,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn Write>) -> Self {
        Self { writer }
    }
}

impl PointSink for JsonLinesSink {
    fn write_point(&mut self, point: &Point) -> io::Result<()> {
        let a = &point.attributes;
        let record = PointRecord {
            x: point.get_x(),
            y: point.get_y(),
            z: point.get_z(),
            intensity: a.intensity,
            return_number: a.return_number,
            number_of_returns: a.number_of_returns,
            classification: a.classification,
            point_source_id: a.point_source_id,
            gps_time: a.gps_time,
            rgb: point.color.map(|c| [c.r, c.g, c.b]),
            flags: a.flags.bits(),
            extra: &a.extra,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Opens a sink writing to `path`, or to stdout when the path is `-`.
pub fn create_sink(path: &Path, format: OutputFormat) -> io::Result<Box<dyn PointSink>> {
    let writer: Box<dyn Write> = if path == Path::new("-") {
        Box::new(BufWriter::new(io::stdout()))
    } else {
        Box::new(BufWriter::new(File::create(path)?))
    };
    Ok(match format {
        OutputFormat::Csv => Box::new(CsvSink::new(writer)),
        OutputFormat::Json => Box::new(JsonLinesSink::new(writer)),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pcd_core::pointcloud::{header::AttributeDescriptor, quantize::Quantizer};

    use super::*;

    fn sample_point() -> Point {
        let mut point = Point::new(Quantizer::new([0.25; 3], [0.0; 3]));
        point.set_coordinates([1.5, 2.25, 3.0]);
        point.attributes.classification = 2;
        point.attributes.return_number = 1;
        point.attributes.number_of_returns = 2;
        point.attributes.gps_time = Some(10.0);
        point.attributes.extra = vec![7.0];
        point
    }

    #[test]
    fn csv_sink_writes_header_and_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut header = Header::default();
        header.add_attribute(AttributeDescriptor::new("amplitude", 10));

        let mut sink = create_sink(&path, OutputFormat::Csv).unwrap();
        sink.begin(&header).unwrap();
        sink.write_point(&sample_point()).unwrap();
        sink.finish().unwrap();
        drop(sink);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("x,y,z,intensity"));
        assert!(lines[0].ends_with(",amplitude"));
        assert!(lines[1].starts_with("1.5,2.25,3,0,1,2,2,"));
        assert!(lines[1].ends_with(",7"));
    }

    #[test]
    fn json_sink_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let mut sink = create_sink(&path, OutputFormat::Json).unwrap();
        sink.write_point(&sample_point()).unwrap();
        sink.write_point(&sample_point()).unwrap();
        sink.finish().unwrap();
        drop(sink);

        let text = fs::read_to_string(&path).unwrap();
        let values: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["x"], 1.5);
        assert_eq!(values[0]["classification"], 2);
        assert_eq!(values[0]["gps_time"], 10.0);
        assert!(values[0].get("rgb").is_none());
    }
}
