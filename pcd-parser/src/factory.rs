use std::{cell::RefCell, path::PathBuf, rc::Rc};

use pcd_core::pointcloud::field_mask::FieldMask;
use pcd_transformer::{FilterChain, TransformPipeline};
use serde::{Deserialize, Serialize};

use crate::{
    decoder::{CsvDecoder, DecoderOptions},
    error::{ConfigError, ReaderError},
    reader::{
        merged::MergeSettings, BufferedReader, MergedReader, PipeOnReader, PointReader,
        PointSink, RescaleReoffset, SharedFilter, SharedTransform, SingleReader, StoredReader,
    },
    region::QueryRegion,
};

/// Everything needed to open a reader. Holds no open resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfiguration {
    pub files: Vec<PathBuf>,
    pub use_stdin: bool,
    /// Read all files as one stream.
    pub merged: bool,
    /// Files providing points around the primary file.
    pub neighbors: Vec<PathBuf>,
    pub buffer_size: f64,
    /// Keep the points in memory after the first pass.
    pub stored: bool,
    /// Forward every delivered point to a sink.
    pub pipe_on: bool,
    pub rescale: RescaleReoffset,
    pub region: QueryRegion,
    pub use_index: bool,
    /// Number flightlines from this point source ID on.
    pub flightline_start: Option<u16>,
    pub apply_file_source_id: bool,
    pub populate_header: bool,
    pub io_buffer_size: usize,
    /// Base path for spilling buffer points to disk.
    pub temp_files: Option<PathBuf>,
    #[serde(skip)]
    pub decompress_selective: Option<FieldMask>,
    #[serde(skip)]
    pub filter: Option<FilterChain>,
    #[serde(skip)]
    pub transform: Option<TransformPipeline>,
}

impl Default for ReaderConfiguration {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            use_stdin: false,
            merged: false,
            neighbors: Vec::new(),
            buffer_size: 0.0,
            stored: false,
            pipe_on: false,
            rescale: RescaleReoffset::default(),
            region: QueryRegion::None,
            use_index: false,
            flightline_start: None,
            apply_file_source_id: false,
            populate_header: true,
            io_buffer_size: 0,
            temp_files: None,
            decompress_selective: None,
            filter: None,
            transform: None,
        }
    }
}

impl ReaderConfiguration {
    pub fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            populate_header: self.populate_header,
            io_buffer_size: self.io_buffer_size,
        }
    }

    pub fn is_merging(&self) -> bool {
        self.merged && self.files.len() > 1
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer_size > 0.0 && !self.neighbors.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_stdin && !self.files.is_empty() {
            return Err(ConfigError::StdinWithFiles);
        }
        if !self.use_stdin && self.files.is_empty() {
            return Err(ConfigError::NoInput);
        }
        if self.files.len() > 1 && !self.merged {
            return Err(ConfigError::UnmergedInputs(self.files.len()));
        }
        if self.buffer_size > 0.0 && self.neighbors.is_empty() {
            return Err(ConfigError::NoNeighbors(self.buffer_size));
        }
        if !self.neighbors.is_empty() && self.buffer_size <= 0.0 {
            return Err(ConfigError::NoBufferSize(self.buffer_size));
        }
        if self.is_buffered() && !self.is_merging() && self.files.len() != 1 {
            return Err(ConfigError::BufferedManyFiles(self.files.len()));
        }
        self.rescale.validate()
    }

    /// One configuration per input file, each with its own copy of the filter and
    /// transform and with flightline numbering continued across files.
    pub fn split_files(&self) -> Vec<ReaderConfiguration> {
        if self.merged || self.files.len() <= 1 {
            return vec![self.clone()];
        }
        self.files
            .iter()
            .enumerate()
            .map(|(i, file)| ReaderConfiguration {
                files: vec![file.clone()],
                flightline_start: self
                    .flightline_start
                    .map(|start| start.wrapping_add(i as u16)),
                ..self.clone()
            })
            .collect()
    }
}

/// Builds readers from a [`ReaderConfiguration`], composing the decorators it asks for.
pub struct ReaderFactory {
    config: ReaderConfiguration,
    sink: Option<Box<dyn PointSink>>,
    filter: Option<SharedFilter>,
    transform: Option<SharedTransform>,
}

impl ReaderFactory {
    pub fn new(config: ReaderConfiguration) -> Self {
        Self {
            config,
            sink: None,
            filter: None,
            transform: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn PointSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ReaderConfiguration {
        &self.config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.config.validate()?;
        if self.config.pipe_on && self.sink.is_none() {
            return Err(ConfigError::MissingSink);
        }
        Ok(())
    }

    /// The filter chain of the last built reader, for reporting counters.
    pub fn filter(&self) -> Option<SharedFilter> {
        self.filter.clone()
    }

    pub fn transform(&self) -> Option<SharedTransform> {
        self.transform.clone()
    }

    pub fn build(&mut self) -> Result<Box<dyn PointReader>, ReaderError> {
        self.validate()?;
        let config = &self.config;
        let options = config.decoder_options();

        let filter = config
            .filter
            .clone()
            .filter(FilterChain::is_active)
            .map(|chain| Rc::new(RefCell::new(chain)));
        let numbering = config.flightline_start.is_some() || config.apply_file_source_id;
        let transform = match config.transform.clone() {
            Some(pipeline) => Some(pipeline),
            None if numbering => Some(TransformPipeline::new()),
            None => None,
        }
        .map(|pipeline| Rc::new(RefCell::new(pipeline)));

        let settings = MergeSettings {
            options,
            rescale: config.rescale,
            flightline_start: config.flightline_start,
            apply_file_source_id: config.apply_file_source_id,
            use_index: config.use_index,
            selective: config.decompress_selective,
        };

        let mut reader: Box<dyn PointReader> = if config.is_merging() {
            if config.is_buffered() {
                log::warn!("merging {} files, the buffer is ignored", config.files.len());
            }
            Box::new(MergedReader::open(config.files.clone(), settings)?)
        } else if config.is_buffered() {
            Box::new(BufferedReader::open(
                &config.files[0],
                &config.neighbors,
                config.buffer_size,
                settings,
                config.temp_files.as_deref(),
            )?)
        } else {
            let mut single = if config.use_stdin {
                SingleReader::new(Box::new(CsvDecoder::from_stdin(&options)?))
            } else {
                SingleReader::open(&config.files[0], &options)?
            };
            single.rescale(&config.rescale);
            single.set_decompress_selective(config.decompress_selective);
            if let Some(pipeline) = &transform {
                if let Some(start) = config.flightline_start {
                    pipeline.borrow_mut().set_point_source(start);
                } else if config.apply_file_source_id {
                    let file_source_id = single.header().file_source_id;
                    pipeline.borrow_mut().set_point_source(file_source_id);
                }
            }
            Box::new(single)
        };

        if let Some(filter) = &filter {
            filter
                .borrow()
                .validate(reader.header())
                .map_err(ConfigError::from)?;
        }
        if let Some(transform) = &transform {
            transform
                .borrow()
                .validate(reader.header())
                .map_err(ConfigError::from)?;
        }

        reader.set_filter(filter.clone());
        reader.set_transform(transform.clone());
        if config.use_index && !reader.set_index(true)? {
            log::warn!("no spatial index is available, scanning instead");
        }
        if !config.region.is_none() && !reader.set_region(config.region) {
            log::info!("{:?} does not intersect the input", config.region);
        }

        if config.stored {
            reader = Box::new(StoredReader::new(reader));
        }
        if config.pipe_on {
            let sink = self.sink.take().ok_or(ConfigError::MissingSink)?;
            reader = Box::new(PipeOnReader::new(reader, sink));
        }

        self.filter = filter;
        self.transform = transform;
        Ok(reader)
    }
}
