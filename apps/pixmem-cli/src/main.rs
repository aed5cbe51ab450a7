use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use pixmem_codec_image::ImageCrateCodec;
use pixmem_core::{
    compress_with_telemetry, convert, estimate_bytes, parse_pixel_format, parse_size_unit, resize_by_canvas, resize_by_scale,
    resolve_compression_config, Codec, CompressionConfig, DecodedImage, EncodedImage, ImageDimensions, SizeUnit,
};
use pixmem_telemetry::{sink_from_env_with_console, ConsoleStream};
use regex::Regex;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "pixmem", version, about = "Bitmap memory accounting and compression tooling")]
struct Cli {
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    /// Report dimensions, decoded memory and file size of images.
    Info(InfoArgs),
    /// Compute decoded memory for given dimensions without any image.
    Estimate(EstimateArgs),
    /// Compress or resample images and report before/after sizes.
    ///
    /// The JSON report is printed on stdout. With PIXMEM_TELEMETRY_SINK=stdout,
    /// telemetry event lines are written to stderr instead.
    Compress(CompressArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// File, directory or file-name regex.
    #[arg(long, short = 'i')]
    input: String,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    /// Recurse when scanning directories / regex matches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// If set, abort the whole run on the first input error.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    strict: bool,
}

#[derive(Args, Debug)]
struct InfoArgs {
    #[command(flatten)]
    inputs: InputArgs,
    #[arg(long, short = 'f', default_value = "argb8888")]
    format: String,
    #[arg(long, short = 'u', default_value = "kb")]
    unit: String,
}

#[derive(Args, Debug)]
struct EstimateArgs {
    #[arg(long, short = 'W')]
    width: u32,
    #[arg(long, short = 'H')]
    height: u32,
    #[arg(long, short = 'f', default_value = "argb8888")]
    format: String,
    #[arg(long, short = 'u', default_value = "kb")]
    unit: String,
}

#[derive(Args, Debug)]
struct CompressArgs {
    #[command(flatten)]
    inputs: InputArgs,
    /// quality, target-size, sample, scale or canvas.
    #[arg(long, short = 'M')]
    mode: Option<String>,
    /// JSON file holding a compression config; flags override it.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    #[arg(long, short = 'q')]
    quality: Option<u8>,
    #[arg(long)]
    max_bytes: Option<u64>,
    #[arg(long)]
    initial_quality: Option<u8>,
    #[arg(long)]
    coarse_step: Option<u8>,
    #[arg(long)]
    fine_threshold: Option<u8>,
    #[arg(long, short = 'W')]
    width: Option<u32>,
    #[arg(long, short = 'H')]
    height: Option<u32>,
    /// Pixel format used when decoding the source.
    #[arg(long, short = 'f')]
    format: Option<String>,
    #[arg(long)]
    canvas_format: Option<String>,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Output directory used when processing multiple inputs.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, short = 'u', default_value = "kb")]
    unit: String,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Quality,
    TargetSize,
    Sample,
    Scale,
    Canvas,
}

impl Mode {
    fn label(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::TargetSize => "target-size",
            Self::Sample => "sample",
            Self::Scale => "scale",
            Self::Canvas => "canvas",
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        TopLevelCommand::Info(args) => run_info(&args)?,
        TopLevelCommand::Estimate(args) => {
            let dims = ImageDimensions::new(args.width, args.height)?;
            let format = parse_pixel_format(&args.format)?;
            let unit = parse_size_unit(&args.unit)?;
            let bytes = estimate_bytes(dims, format);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "width": dims.width(),
                    "height": dims.height(),
                    "format": format.label(),
                    "bytesPerPixel": format.bytes_per_pixel(),
                    "bytes": bytes,
                    "unit": unit.label(),
                    "size": convert(bytes, unit),
                }))?
            );
        }
        TopLevelCommand::Compress(args) => run_compress(&args)?,
    }

    Ok(())
}

fn run_info(args: &InfoArgs) -> Result<()> {
    let format = parse_pixel_format(&args.format)?;
    let unit = parse_size_unit(&args.unit)?;
    let codec = ImageCrateCodec::new(format);
    let inputs = resolve_inputs(&args.inputs)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let bulk_mode = inputs.len() > 1;
    let mut results = Vec::with_capacity(inputs.len());
    for input_path in inputs {
        let report = std::fs::read(&input_path)
            .with_context(|| format!("failed to read input {}", input_path.display()))
            .and_then(|source| {
                let decoded = codec.decode(&source)?;
                let full_quality = codec.encode(&decoded, 100)?;
                let mut report = image_report(&decoded, source.len() as u64, unit);
                report["jpegAt100"] = serde_json::json!(convert(full_quality.len() as u64, unit));
                Ok(report)
            });
        match report {
            Ok(mut report) => {
                report["input"] = serde_json::json!(input_path);
                results.push(report);
            }
            Err(err) if bulk_mode && !args.inputs.strict => {
                results.push(serde_json::json!({ "input": input_path, "error": format!("{:#}", err) }));
            }
            Err(err) => return Err(err),
        }
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "unit": unit.label(), "results": results }))?
    );
    Ok(())
}

fn run_compress(args: &CompressArgs) -> Result<()> {
    let total_start = Instant::now();
    let config = build_config(args)?;
    let mode = parse_mode(&config.mode)?;
    let unit = parse_size_unit(&args.unit)?;
    let codec = ImageCrateCodec::new(config.preferred_format()?);
    // The report owns stdout; console telemetry goes to stderr.
    let telemetry = sink_from_env_with_console(ConsoleStream::Stderr);
    let telemetry_ref = telemetry.as_ref().map(|sink| sink.as_ref());

    let inputs = resolve_inputs(&args.inputs)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let bulk_mode = inputs.len() > 1;
    let mut results = Vec::with_capacity(inputs.len());

    for input_path in inputs {
        let start = Instant::now();
        let outcome = compress_one(args, &config, mode, unit, &codec, telemetry_ref, &input_path, bulk_mode);
        match outcome {
            Ok(mut report) => {
                if args.profile {
                    report["timingsMs"] = serde_json::json!(start.elapsed().as_millis());
                }
                results.push(report);
            }
            Err(err) if bulk_mode && !args.inputs.strict => {
                log::warn!("skipping {}: {:#}", input_path.display(), err);
                results.push(serde_json::json!({ "input": input_path, "error": format!("{:#}", err) }));
            }
            Err(err) => return Err(err),
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "mode": mode.label(),
            "unit": unit.label(),
            "results": results,
            "totalMs": if args.profile { Some(total_start.elapsed().as_millis()) } else { None },
        }))?
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn compress_one(
    args: &CompressArgs,
    config: &CompressionConfig,
    mode: Mode,
    unit: SizeUnit,
    codec: &ImageCrateCodec,
    telemetry: Option<&dyn pixmem_core::TelemetrySink>,
    input_path: &Path,
    bulk_mode: bool,
) -> Result<serde_json::Value> {
    let source = std::fs::read(input_path).with_context(|| format!("failed to read input {}", input_path.display()))?;
    let original = codec.decode(&source)?;
    let before = image_report(&original, source.len() as u64, unit);

    let (after_image, written, summary) = match mode {
        Mode::Quality | Mode::TargetSize | Mode::Sample => {
            let policy = config.to_policy()?;
            let outcome = compress_with_telemetry(codec, &EncodedImage::new(source.clone()), &policy, telemetry)?;
            let summary = serde_json::to_value(outcome.summary())?;
            match (outcome.encoded(), outcome.decoded()) {
                (Some(encoded), _) => (codec.decode(encoded.as_bytes())?, encoded.clone(), summary),
                (None, Some(decoded)) => (decoded.clone(), codec.encode(decoded, 100)?, summary),
                (None, None) => return Err(anyhow!("compression produced no output")),
            }
        }
        Mode::Scale | Mode::Canvas => {
            let resized = if mode == Mode::Scale {
                resize_by_scale(codec, &original, config.request_width, config.request_height, true)?
            } else {
                resize_by_canvas(codec, &original, config.request_width, config.request_height, config.canvas_format()?)?
            };
            let encoded = codec.encode(&resized, 100)?;
            (resized, encoded, serde_json::json!({ "policy": mode.label() }))
        }
    };

    let output_path = resolve_output_for_input(args, input_path, mode, bulk_mode)?;
    write_output(&output_path, written.as_bytes())?;
    let after = image_report(&after_image, file_size(&output_path, SizeUnit::Bytes)?, unit);
    log::info!(
        "{}: {} -> {} ({} bytes written)",
        input_path.display(),
        original.dimensions(),
        after_image.dimensions(),
        written.len()
    );

    Ok(serde_json::json!({
        "input": input_path,
        "output": output_path,
        "before": before,
        "after": after,
        "outcome": summary,
    }))
}

fn image_report(image: &DecodedImage, file_bytes: u64, unit: SizeUnit) -> serde_json::Value {
    serde_json::json!({
        "width": image.width(),
        "height": image.height(),
        "format": image.format().label(),
        "memory": convert(image.allocation_byte_count(), unit),
        "estimatedMemory": convert(image.estimated_bytes(), unit),
        "fileSize": convert(file_bytes, unit),
    })
}

fn build_config(args: &CompressArgs) -> Result<CompressionConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<CompressionConfig>(&raw).with_context(|| format!("invalid config {}", path.display()))?
        }
        None => CompressionConfig::default(),
    };
    if let Some(mode) = &args.mode {
        cfg.mode = mode.clone();
    }
    if let Some(format) = &args.format {
        cfg.preferred_format = format.clone();
    }
    if let Some(format) = &args.canvas_format {
        cfg.canvas_format = format.clone();
    }
    cfg.quality = args.quality.unwrap_or(cfg.quality);
    cfg.max_bytes = args.max_bytes.unwrap_or(cfg.max_bytes);
    cfg.initial_quality = args.initial_quality.unwrap_or(cfg.initial_quality);
    cfg.coarse_step = args.coarse_step.unwrap_or(cfg.coarse_step);
    cfg.fine_threshold = args.fine_threshold.unwrap_or(cfg.fine_threshold);
    cfg.request_width = args.width.unwrap_or(cfg.request_width);
    cfg.request_height = args.height.unwrap_or(cfg.request_height);
    Ok(resolve_compression_config(cfg))
}

fn parse_mode(value: &str) -> Result<Mode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "quality" => Ok(Mode::Quality),
        "target-size" | "size" => Ok(Mode::TargetSize),
        "sample" | "subsample" => Ok(Mode::Sample),
        "scale" => Ok(Mode::Scale),
        "canvas" => Ok(Mode::Canvas),
        other => Err(anyhow!(
            "unknown mode '{}'; expected one of: quality, target-size, sample, scale, canvas",
            other
        )),
    }
}

fn resolve_inputs(args: &InputArgs) -> Result<Vec<PathBuf>> {
    let candidate = PathBuf::from(&args.input);
    if candidate.exists() {
        if candidate.is_dir() {
            return collect_images_in_dir(&candidate, args.recursive);
        }
        return Ok(vec![candidate]);
    }
    // Treat as regex matching file name under input_root.
    let root = args
        .input_root
        .clone()
        .unwrap_or(std::env::current_dir().map_err(|e| anyhow!(e.to_string()))?);
    let re = Regex::new(&args.input).map_err(|e| anyhow!("invalid regex: {}", e))?;
    collect_images_by_regex(&root, args.recursive, &re)
}

fn walker(root: &Path, recursive: bool) -> WalkDir {
    if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    }
}

fn collect_images_in_dir(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = walker(dir, recursive)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|p| is_supported_image(p))
        .collect();
    out.sort();
    Ok(out)
}

fn collect_images_by_regex(root: &Path, recursive: bool, re: &Regex) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walker(root, recursive).into_iter().filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.into_path();
        if !is_supported_image(&p) {
            continue;
        }
        let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if re.is_match(name) {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

fn is_supported_image(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "png" | "jpg" | "jpeg")
}

fn resolve_output_for_input(args: &CompressArgs, input_path: &Path, mode: Mode, bulk_mode: bool) -> Result<PathBuf> {
    let filename = default_output_filename(input_path, mode)?;
    if bulk_mode {
        // -o names a directory when several inputs are processed.
        if let Some(dir) = args.output_dir.clone().or_else(|| args.output.clone()) {
            return Ok(dir.join(filename));
        }
    } else if let Some(path) = args.output.clone() {
        return Ok(path);
    } else if let Some(dir) = args.output_dir.clone() {
        return Ok(dir.join(filename));
    }
    Ok(match input_path.parent() {
        Some(parent) => parent.join(filename),
        None => PathBuf::from(filename),
    })
}

fn default_output_filename(input: &Path, mode: Mode) -> Result<String> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("input file must include a valid file name"))?
        .to_string_lossy();
    Ok(format!("{}_{}.jpg", stem, mode.label()))
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn file_size(path: &Path, unit: SizeUnit) -> Result<u64> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("reading size of {}", path.display()))?
        .len();
    Ok(convert(len, unit))
}
