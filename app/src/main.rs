mod options;
mod sink;

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Local;
use clap::Parser;
use env_logger::Builder;
use glob::glob;
use log::LevelFilter;
use rayon::iter::{IntoParallelIterator as _, ParallelIterator as _};

use options::{FilterArgs, TransformArgs};
use pcd_core::pointcloud::header::Header;
use pcd_parser::{
    decoder::{open_decoder, DecoderOptions},
    index::{index_path, GridIndex},
    reader::RescaleReoffset,
    ConfigError, QueryRegion, ReaderConfiguration, ReaderError, ReaderFactory,
};
use pcd_transformer::{FilterError, TransformError};
use sink::{create_sink, OutputFormat};

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("pipe-on needs an output to forward points to")]
    PipeOnWithoutOutput,
    #[error("cannot write {0} separately processed files to stdout")]
    StdoutWithManyFiles(usize),
}

#[derive(Parser, Debug)]
#[command(
    name = "pstream",
    about = "Read, filter and transform LiDAR point clouds as one stream",
    author = "MIERUNE Inc.",
    version = "0.0.1"
)]
struct Cli {
    #[arg(short, long, num_args = 1.., value_name = "FILE")]
    input: Vec<String>,

    /// Text file listing one input path per line.
    #[arg(long, value_name = "FILE")]
    list: Option<PathBuf>,

    /// Read delimited text points from stdin.
    #[arg(long)]
    stdin: bool,

    /// JSON reader configuration; flags given on the command line take precedence.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output file, a directory when several files are processed separately, `-` for stdout.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    #[arg(long)]
    merged: bool,

    /// Buffer width around the input taken from the neighbor files.
    #[arg(long, value_name = "SIZE")]
    buffered: Option<f64>,

    #[arg(long, num_args = 1.., value_name = "FILE")]
    neighbors: Vec<String>,

    #[arg(long)]
    stored: bool,

    /// Forward points to the output from inside the reader.
    #[arg(long)]
    pipe_on: bool,

    /// Number of passes over the input.
    #[arg(long, default_value_t = 1)]
    passes: u32,

    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
    rescale: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["X", "Y"])]
    rescale_xy: Option<Vec<f64>>,

    #[arg(long, value_name = "Z")]
    rescale_z: Option<f64>,

    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true)]
    reoffset: Option<Vec<f64>>,

    #[arg(long)]
    auto_reoffset: bool,

    #[arg(long, num_args = 3, value_names = ["LL_X", "LL_Y", "SIZE"], allow_negative_numbers = true)]
    inside_tile: Option<Vec<f64>>,

    #[arg(long, num_args = 3, value_names = ["X", "Y", "RADIUS"], allow_negative_numbers = true)]
    inside_circle: Option<Vec<f64>>,

    #[arg(long, num_args = 4, value_names = ["MIN_X", "MIN_Y", "MAX_X", "MAX_Y"], allow_negative_numbers = true)]
    inside_rectangle: Option<Vec<f64>>,

    /// Use spatial index sidecars, building them in memory when missing.
    #[arg(long)]
    index: bool,

    /// Write a spatial index sidecar next to every input before reading.
    #[arg(long, value_name = "CELL_SIZE")]
    build_index: Option<f64>,

    /// Treat files as flightlines, numbering point sources from this value.
    #[arg(long, num_args = 0..=1, default_missing_value = "1", value_name = "START")]
    faf: Option<u16>,

    /// Added to the flightline numbering.
    #[arg(long, default_value_t = 0)]
    faf_index: u16,

    #[arg(long)]
    apply_file_source_id: bool,

    /// I/O buffer size in bytes.
    #[arg(long, value_name = "BYTES")]
    io_ibuffer: Option<usize>,

    /// Base path for spilling buffer points to disk.
    #[arg(long, value_name = "BASE")]
    temp_files: Option<PathBuf>,

    /// Skip the statistics pass over text inputs.
    #[arg(long)]
    no_populate: bool,

    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    filter: FilterArgs,

    #[command(flatten)]
    transform: TransformArgs,
}

fn expand_globs(input_patterns: &[String]) -> Result<Vec<PathBuf>, AppError> {
    let mut paths = Vec::new();
    for pattern in input_patterns {
        if pattern.contains('*') || pattern.contains('?') || pattern.contains('[') {
            for entry in glob(pattern)? {
                match entry {
                    Ok(path) => paths.push(path),
                    Err(e) => log::warn!("skipping unreadable path: {:?}", e),
                }
            }
        } else {
            paths.push(PathBuf::from(pattern));
        }
    }
    Ok(paths)
}

fn read_list(path: &Path) -> Result<Vec<String>, AppError> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn region_from_args(cli: &Cli) -> Option<QueryRegion> {
    if let Some(v) = &cli.inside_tile {
        return Some(QueryRegion::Tile {
            ll_x: v[0],
            ll_y: v[1],
            size: v[2],
        });
    }
    if let Some(v) = &cli.inside_circle {
        return Some(QueryRegion::Circle {
            center_x: v[0],
            center_y: v[1],
            radius: v[2],
        });
    }
    cli.inside_rectangle.as_ref().map(|v| QueryRegion::Rectangle {
        min_x: v[0],
        min_y: v[1],
        max_x: v[2],
        max_y: v[3],
    })
}

fn apply_rescale(cli: &Cli, rescale: &mut RescaleReoffset) {
    if let Some(v) = &cli.rescale {
        rescale.scale = [Some(v[0]), Some(v[1]), Some(v[2])];
    }
    if let Some(v) = &cli.rescale_xy {
        rescale.scale[0] = Some(v[0]);
        rescale.scale[1] = Some(v[1]);
    }
    if let Some(z) = cli.rescale_z {
        rescale.scale[2] = Some(z);
    }
    if let Some(v) = &cli.reoffset {
        rescale.offset = Some([v[0], v[1], v[2]]);
    }
    rescale.auto_offset |= cli.auto_reoffset;
}

/// Layers the command line over the optional configuration file.
fn build_configuration(cli: &Cli) -> Result<ReaderConfiguration, AppError> {
    let mut config = match &cli.config {
        Some(path) => serde_json::from_reader(fs::File::open(path)?)?,
        None => ReaderConfiguration::default(),
    };

    let mut patterns = cli.input.clone();
    if let Some(list) = &cli.list {
        patterns.extend(read_list(list)?);
    }
    config.files.extend(expand_globs(&patterns)?);
    config.neighbors.extend(expand_globs(&cli.neighbors)?);
    config.use_stdin |= cli.stdin;
    config.merged |= cli.merged;
    config.stored |= cli.stored;
    config.pipe_on |= cli.pipe_on;
    config.use_index |= cli.index;
    config.apply_file_source_id |= cli.apply_file_source_id;
    if cli.no_populate {
        config.populate_header = false;
    }
    if let Some(size) = cli.buffered {
        config.buffer_size = size;
    }
    if let Some(size) = cli.io_ibuffer {
        config.io_buffer_size = size;
    }
    if let Some(base) = &cli.temp_files {
        config.temp_files = Some(base.clone());
    }
    if let Some(start) = cli.faf {
        config.flightline_start = Some(start.wrapping_add(cli.faf_index));
    }
    if let Some(region) = region_from_args(cli) {
        config.region = region;
    }
    apply_rescale(cli, &mut config.rescale);

    config.filter = cli.filter.to_chain()?;
    config.transform = cli.transform.to_pipeline(cli.filter.seed)?;
    // Without output only the fields the filter and transform look at are decoded.
    if let (Some(chain), None) = (&config.filter, &cli.output) {
        let mut mask = chain.decompress_hint();
        if let Some(pipeline) = &config.transform {
            mask |= pipeline.decompress_hint();
        }
        config.decompress_selective = Some(mask);
    }
    Ok(config)
}

fn build_indexes(
    files: &[PathBuf],
    cell_size: f64,
    options: &DecoderOptions,
) -> Result<(), AppError> {
    for file in files {
        let mut decoder = open_decoder(file, options)?;
        let index = GridIndex::build(&mut *decoder, cell_size)?;
        let path = index_path(file);
        index.write(&path)?;
        log::info!(
            "indexed {} points of {:?} into {} cells at {:?}",
            index.point_count(),
            file,
            index.cell_count(),
            path
        );
        decoder.close();
    }
    Ok(())
}

fn log_header(name: &str, header: &Header) {
    log::info!("{}: {} points, format {}", name, header.point_count, header.point_format);
    if !header.bounds.is_empty() {
        log::info!(
            "{}: bounds {:?} - {:?}",
            name,
            header.bounds.min,
            header.bounds.max
        );
    }
    log::debug!(
        "{}: scale {:?}, offset {:?}",
        name,
        header.quantizer.scale,
        header.quantizer.offset
    );
}

fn output_path(dir: &Path, input: &Path, format: OutputFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "points".to_string());
    dir.join(format!("{}.{}", stem, format.extension()))
}

/// Reads one configuration to the end, returning the points of the last pass.
fn process(
    config: ReaderConfiguration,
    target: Option<PathBuf>,
    format: OutputFormat,
    passes: u32,
) -> Result<u64, AppError> {
    let name = match config.files.as_slice() {
        [] => "stdin".to_string(),
        [file] => file.display().to_string(),
        files => format!("{} merged files", files.len()),
    };
    let pipe_on = config.pipe_on;
    let mut sink = target
        .as_deref()
        .map(|path| create_sink(path, format))
        .transpose()?;

    let mut factory = ReaderFactory::new(config);
    if pipe_on {
        let sink = sink.take().ok_or(AppError::PipeOnWithoutOutput)?;
        factory = factory.with_sink(sink);
    }
    let mut reader = factory.build()?;
    log_header(&name, reader.header());

    let mut delivered = 0;
    for pass in 0..passes.max(1) {
        if pass > 0 {
            reader.reopen()?;
        }
        let mut writer = if pass == 0 { sink.as_mut() } else { None };
        if let Some(sink) = writer.as_mut() {
            sink.begin(reader.header())?;
        }
        let mut count = 0;
        while reader.read_next() {
            if let Some(sink) = writer.as_mut() {
                sink.write_point(reader.point())?;
            }
            count += 1;
        }
        if let Some(sink) = writer.as_mut() {
            sink.finish()?;
        }
        log::info!("{}: pass {} delivered {} points", name, pass + 1, count);
        delivered = count;
    }

    if let Some(filter) = factory.filter() {
        let filter = filter.borrow();
        log::info!("{}: filter rejected {} points", name, filter.total_rejected());
        filter.log_summary();
    }
    if let Some(transform) = factory.transform() {
        let vetoed = transform.borrow().vetoed();
        if vetoed > 0 {
            log::info!("{}: transform vetoed {} points", name, vetoed);
        }
    }
    reader.close();
    Ok(delivered)
}

fn run(cli: Cli) -> Result<(), AppError> {
    let config = build_configuration(&cli)?;
    log::info!("input files: {:?}", config.files);

    if let Some(cell_size) = cli.build_index {
        build_indexes(&config.files, cell_size, &config.decoder_options())?;
    }

    let configs = config.split_files();
    let separate = configs.len() > 1;
    if separate {
        if let Some(output) = &cli.output {
            if output == Path::new("-") {
                return Err(AppError::StdoutWithManyFiles(configs.len()));
            }
            fs::create_dir_all(output)?;
        }
    }

    let output = cli.output.clone();
    let (format, passes) = (cli.format, cli.passes);
    let results: Vec<Result<u64, AppError>> = configs
        .into_par_iter()
        .map(|config| {
            let target = match (&output, separate) {
                (Some(dir), true) => Some(output_path(dir, &config.files[0], format)),
                (target, _) => target.clone(),
            };
            process(config, target, format, passes)
        })
        .collect();

    let mut delivered = 0;
    for result in results {
        delivered += result?;
    }
    log::info!("delivered {} points in total", delivered);
    Ok(())
}

fn main() {
    let args = Cli::parse();

    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            if args.verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            },
        )
        .init();

    let start = std::time::Instant::now();
    if let Err(error) = run(args) {
        log::error!("{}", error);
        std::process::exit(1);
    }
    log::info!("Elapsed: {:?}", start.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pstream").chain(args.iter().copied())).unwrap()
    }

    fn write_grid(dir: &Path, name: &str) -> PathBuf {
        let mut text = String::from("x,y,z,classification\n");
        for i in 0..10 {
            text.push_str(&format!("{}.5,{}.25,{},{}\n", i, i, i, if i % 2 == 0 { 2 } else { 6 }));
        }
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn flags_map_onto_the_configuration() {
        let cli = parse(&[
            "-i", "a.las", "b.las", "--merged", "--faf", "--faf-index", "4",
            "--rescale-xy", "0.01", "0.01", "--auto-reoffset",
            "--inside-tile", "100", "200", "50", "--keep-class", "2",
        ]);
        let config = build_configuration(&cli).unwrap();
        assert_eq!(config.files.len(), 2);
        assert!(config.merged);
        assert_eq!(config.flightline_start, Some(5));
        assert_eq!(config.rescale.scale, [Some(0.01), Some(0.01), None]);
        assert!(config.rescale.auto_offset);
        assert_eq!(
            config.region,
            QueryRegion::Tile { ll_x: 100.0, ll_y: 200.0, size: 50.0 }
        );
        assert_eq!(config.filter.as_ref().map(|f| f.len()), Some(1));
        assert!(config.decompress_selective.is_some());
        assert!(config.transform.is_none());
    }

    #[test]
    fn faf_accepts_an_explicit_start() {
        let config = build_configuration(&parse(&["-i", "a.las", "--faf", "100"])).unwrap();
        assert_eq!(config.flightline_start, Some(100));
    }

    #[test]
    fn command_line_overrides_configuration_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"files": ["a.csv"], "stored": true, "buffer_size": 5.0,
                "region": {"type": "circle", "center_x": 1.0, "center_y": 2.0, "radius": 3.0}}"#,
        )
        .unwrap();
        let config = build_configuration(&parse(&[
            "--config",
            path.to_str().unwrap(),
            "--buffered",
            "10",
        ]))
        .unwrap();
        assert_eq!(config.files, vec![PathBuf::from("a.csv")]);
        assert!(config.stored);
        assert_eq!(config.buffer_size, 10.0);
        assert!(matches!(config.region, QueryRegion::Circle { .. }));
    }

    #[test]
    fn processes_and_writes_filtered_points() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_grid(dir.path(), "grid.csv");
        let output = dir.path().join("out.csv");
        let cli = parse(&[
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--keep-class",
            "2",
        ]);
        run(cli).unwrap();

        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text.lines().count(), 6);
    }

    #[test]
    fn separate_files_go_to_an_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_grid(dir.path(), "a.csv");
        let b = write_grid(dir.path(), "b.csv");
        let out = dir.path().join("out");
        let cli = parse(&[
            "-i",
            a.to_str().unwrap(),
            b.to_str().unwrap(),
            "-o",
            out.to_str().unwrap(),
            "--format",
            "json",
        ]);
        run(cli).unwrap();

        for stem in ["a", "b"] {
            let text = fs::read_to_string(out.join(format!("{}.jsonl", stem))).unwrap();
            assert_eq!(text.lines().count(), 10);
        }
    }

    #[test]
    fn pipe_on_without_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_grid(dir.path(), "grid.csv");
        let cli = parse(&["-i", input.to_str().unwrap(), "--pipe-on"]);
        assert!(matches!(run(cli), Err(AppError::PipeOnWithoutOutput)));
    }

    #[test]
    fn stored_passes_replay_through_pipe_on() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_grid(dir.path(), "grid.csv");
        let output = dir.path().join("piped.csv");
        let cli = parse(&[
            "-i",
            input.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--pipe-on",
            "--stored",
            "--passes",
            "2",
        ]);
        run(cli).unwrap();

        // each pass writes its own header row
        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text.lines().count(), 22);
    }
}
