use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pixmem_image::{
    bytes_per_pixel, convert, encoded_size, estimate_bytes, footprint_matches, DimensionError, ImageDimensions, PixelFormat,
    SizeUnit,
};

pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;

/// Compressed image bytes (JPEG, PNG, ...). Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage(Vec<u8>);

impl EncodedImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn size_in(&self, unit: SizeUnit) -> u64 {
        encoded_size(&self.0, unit)
    }
}

impl From<Vec<u8>> for EncodedImage {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for EncodedImage {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Pixel buffer laid out in `format`, exactly `estimate_bytes(dimensions, format)` long.
///
/// The footprint check happens once, in `new`: a buffer whose length differs
/// from the estimate is rejected, so every value carries a consistent footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    dimensions: ImageDimensions,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(dimensions: ImageDimensions, format: PixelFormat, pixels: Vec<u8>) -> Result<Self, DimensionError> {
        pixmem_image::check_buffer_len(dimensions, format, pixels.len())?;
        Ok(Self {
            dimensions,
            format,
            pixels,
        })
    }

    pub fn dimensions(&self) -> ImageDimensions {
        self.dimensions
    }

    pub fn width(&self) -> u32 {
        self.dimensions.width()
    }

    pub fn height(&self) -> u32 {
        self.dimensions.height()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn estimated_bytes(&self) -> u64 {
        estimate_bytes(self.dimensions, self.format)
    }

    /// Bytes actually held by the pixel buffer.
    pub fn allocation_byte_count(&self) -> u64 {
        self.pixels.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn covering(dimensions: ImageDimensions) -> Self {
        Self {
            x: 0,
            y: 0,
            width: dimensions.width(),
            height: dimensions.height(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed image data: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
}

/// Encode/decode capability the engine delegates every pixel operation to.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, CodecError>;
    /// Reads only the header; no pixel buffer is materialized.
    fn decode_bounds(&self, bytes: &[u8]) -> Result<ImageDimensions, CodecError>;
    fn decode_scaled(&self, bytes: &[u8], sample_factor: u32) -> Result<DecodedImage, CodecError>;
    fn encode(&self, image: &DecodedImage, quality: u8) -> Result<EncodedImage, CodecError>;
    fn scale(&self, image: &DecodedImage, width: u32, height: u32, smooth: bool) -> Result<DecodedImage, CodecError>;
    /// Draws `image` stretched into `dest` on a fresh `canvas` of `format`.
    fn fit(
        &self,
        image: &DecodedImage,
        canvas: ImageDimensions,
        format: PixelFormat,
        dest: Rect,
    ) -> Result<DecodedImage, CodecError>;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<CodecError> for CoreError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode(message) => Self::Decode(message),
            other => Self::Codec(other.to_string()),
        }
    }
}

impl From<DimensionError> for CoreError {
    fn from(err: DimensionError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    DecodeError,
    InvalidArgument,
    CodecError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn as_error_info(&self) -> ErrorInfo {
        match self {
            Self::Decode(message) => ErrorInfo {
                code: ErrorCode::DecodeError,
                message: message.clone(),
            },
            Self::InvalidArgument(message) => ErrorInfo {
                code: ErrorCode::InvalidArgument,
                message: message.clone(),
            },
            Self::Codec(message) => ErrorInfo {
                code: ErrorCode::CodecError,
                message: message.clone(),
            },
        }
    }
}

/// Quality decrements used by the target-size search.
///
/// Above `fine_threshold` quality drops by `coarse_step` (never past the
/// threshold), at or below it by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSchedule {
    pub coarse_step: u8,
    pub fine_threshold: u8,
}

impl Default for StepSchedule {
    fn default() -> Self {
        Self {
            coarse_step: 10,
            fine_threshold: 10,
        }
    }
}

impl StepSchedule {
    pub fn next_quality(&self, quality: u8) -> u8 {
        let next = if quality <= self.fine_threshold {
            quality.saturating_sub(1)
        } else {
            quality.saturating_sub(self.coarse_step).max(self.fine_threshold)
        };
        next.max(MIN_QUALITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CompressionPolicy {
    ByQuality {
        quality: u8,
    },
    #[serde(rename_all = "camelCase")]
    ByTargetFileSize {
        max_bytes: u64,
        initial_quality: u8,
        schedule: StepSchedule,
    },
    #[serde(rename_all = "camelCase")]
    BySubsampledDimensions {
        request_width: u32,
        request_height: u32,
    },
}

impl CompressionPolicy {
    pub fn by_target_file_size(max_bytes: u64) -> Self {
        Self::ByTargetFileSize {
            max_bytes,
            initial_quality: 90,
            schedule: StepSchedule::default(),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::ByQuality { .. } => PolicyKind::Quality,
            Self::ByTargetFileSize { .. } => PolicyKind::TargetSize,
            Self::BySubsampledDimensions { .. } => PolicyKind::Subsampled,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        match *self {
            Self::ByQuality { quality } => check_quality(quality, 0),
            Self::ByTargetFileSize {
                max_bytes,
                initial_quality,
                schedule,
            } => {
                if max_bytes == 0 {
                    return Err(CoreError::InvalidArgument("max bytes must be positive".to_string()));
                }
                if schedule.coarse_step == 0 {
                    return Err(CoreError::InvalidArgument("coarse quality step must be positive".to_string()));
                }
                check_quality(initial_quality, MIN_QUALITY)
            }
            Self::BySubsampledDimensions {
                request_width,
                request_height,
            } => {
                ImageDimensions::new(request_width, request_height)?;
                Ok(())
            }
        }
    }
}

fn check_quality(quality: u8, min: u8) -> Result<(), CoreError> {
    if quality < min || quality > MAX_QUALITY {
        return Err(CoreError::InvalidArgument(format!(
            "quality {} outside {}..={}",
            quality, min, MAX_QUALITY
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    Quality,
    TargetSize,
    Subsampled,
}

impl PolicyKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::TargetSize => "target-size",
            Self::Subsampled => "sample",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetSizeOutcome {
    pub encoded: EncodedImage,
    pub quality: u8,
    pub attempts: u32,
    pub met_target: bool,
}

#[derive(Debug, Clone)]
pub struct SubsampleOutcome {
    pub image: DecodedImage,
    pub native: ImageDimensions,
    pub sample_factor: u32,
}

#[derive(Debug, Clone)]
pub enum CompressionOutcome {
    Quality { encoded: EncodedImage, quality: u8 },
    TargetSize(TargetSizeOutcome),
    Subsampled(SubsampleOutcome),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeSummary {
    pub policy: PolicyKind,
    pub quality: Option<u8>,
    pub attempts: Option<u32>,
    pub met_target: Option<bool>,
    pub encoded_bytes: Option<u64>,
    pub sample_factor: Option<u32>,
    pub native: Option<ImageDimensions>,
    pub decoded: Option<ImageDimensions>,
}

impl CompressionOutcome {
    pub fn encoded(&self) -> Option<&EncodedImage> {
        match self {
            Self::Quality { encoded, .. } => Some(encoded),
            Self::TargetSize(outcome) => Some(&outcome.encoded),
            Self::Subsampled(_) => None,
        }
    }

    pub fn decoded(&self) -> Option<&DecodedImage> {
        match self {
            Self::Subsampled(outcome) => Some(&outcome.image),
            _ => None,
        }
    }

    pub fn summary(&self) -> OutcomeSummary {
        let mut summary = OutcomeSummary {
            policy: PolicyKind::Quality,
            quality: None,
            attempts: None,
            met_target: None,
            encoded_bytes: self.encoded().map(|e| e.len() as u64),
            sample_factor: None,
            native: None,
            decoded: self.decoded().map(DecodedImage::dimensions),
        };
        match self {
            Self::Quality { quality, .. } => summary.quality = Some(*quality),
            Self::TargetSize(outcome) => {
                summary.policy = PolicyKind::TargetSize;
                summary.quality = Some(outcome.quality);
                summary.attempts = Some(outcome.attempts);
                summary.met_target = Some(outcome.met_target);
            }
            Self::Subsampled(outcome) => {
                summary.policy = PolicyKind::Subsampled;
                summary.sample_factor = Some(outcome.sample_factor);
                summary.native = Some(outcome.native);
            }
        }
        summary
    }

    fn detail(&self) -> String {
        match self {
            Self::Quality { encoded, quality } => format!("quality={},bytes={}", quality, encoded.len()),
            Self::TargetSize(outcome) => format!(
                "quality={},attempts={},met={},bytes={}",
                outcome.quality,
                outcome.attempts,
                outcome.met_target,
                outcome.encoded.len()
            ),
            Self::Subsampled(outcome) => format!(
                "sample={},native={},decoded={}",
                outcome.sample_factor,
                outcome.native,
                outcome.image.dimensions()
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEventType {
    CompressStart,
    CompressSuccess,
    CompressError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub policy: PolicyKind,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// User-facing compression knobs. String fields accept the CLI labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    pub mode: String,
    pub quality: u8,
    pub max_bytes: u64,
    pub initial_quality: u8,
    pub coarse_step: u8,
    pub fine_threshold: u8,
    pub request_width: u32,
    pub request_height: u32,
    pub preferred_format: String,
    pub canvas_format: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            mode: "quality".to_string(),
            quality: 10,
            max_bytes: 100 * 1024,
            initial_quality: 90,
            coarse_step: 10,
            fine_threshold: 10,
            request_width: 300,
            request_height: 300,
            preferred_format: "rgb565".to_string(),
            canvas_format: "rgb565".to_string(),
        }
    }
}

impl CompressionConfig {
    pub fn to_policy(&self) -> Result<CompressionPolicy, CoreError> {
        let policy = match self.mode.trim().to_ascii_lowercase().as_str() {
            "quality" => CompressionPolicy::ByQuality { quality: self.quality },
            "target-size" | "size" => CompressionPolicy::ByTargetFileSize {
                max_bytes: self.max_bytes,
                initial_quality: self.initial_quality,
                schedule: StepSchedule {
                    coarse_step: self.coarse_step,
                    fine_threshold: self.fine_threshold,
                },
            },
            "sample" | "subsample" => CompressionPolicy::BySubsampledDimensions {
                request_width: self.request_width,
                request_height: self.request_height,
            },
            other => {
                return Err(CoreError::InvalidArgument(format!(
                    "unknown compression mode '{}'; expected one of: quality, target-size, sample",
                    other
                )))
            }
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn preferred_format(&self) -> Result<PixelFormat, CoreError> {
        parse_pixel_format(&self.preferred_format)
    }

    pub fn canvas_format(&self) -> Result<PixelFormat, CoreError> {
        parse_pixel_format(&self.canvas_format)
    }
}

pub fn resolve_compression_config(overrides: CompressionConfig) -> CompressionConfig {
    let mut cfg = CompressionConfig::default();
    if !overrides.mode.trim().is_empty() {
        cfg.mode = overrides.mode;
    }
    if !overrides.preferred_format.trim().is_empty() {
        cfg.preferred_format = overrides.preferred_format;
    }
    if !overrides.canvas_format.trim().is_empty() {
        cfg.canvas_format = overrides.canvas_format;
    }
    cfg.quality = overrides.quality;
    cfg.max_bytes = overrides.max_bytes;
    cfg.initial_quality = overrides.initial_quality;
    cfg.coarse_step = overrides.coarse_step;
    cfg.fine_threshold = overrides.fine_threshold;
    cfg.request_width = overrides.request_width;
    cfg.request_height = overrides.request_height;
    cfg
}

pub mod v1 {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CompressRequest {
        pub image_bytes: Vec<u8>,
        pub policy: CompressionPolicy,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CompressResponse {
        pub summary: Option<OutcomeSummary>,
        pub encoded_bytes: Option<Vec<u8>>,
        pub error: Option<ErrorInfo>,
    }

    impl CompressRequest {
        pub fn from_config(image_bytes: Vec<u8>, config: &CompressionConfig) -> Result<Self, CoreError> {
            Ok(Self {
                image_bytes,
                policy: config.to_policy()?,
            })
        }
    }

    impl From<Result<CompressionOutcome, CoreError>> for CompressResponse {
        fn from(result: Result<CompressionOutcome, CoreError>) -> Self {
            match result {
                Ok(outcome) => Self {
                    summary: Some(outcome.summary()),
                    encoded_bytes: outcome.encoded().map(|e| e.as_bytes().to_vec()),
                    error: None,
                },
                Err(err) => Self {
                    summary: None,
                    encoded_bytes: None,
                    error: Some(err.as_error_info()),
                },
            }
        }
    }

    /// Runs a request end to end; failures land in `error` instead of an `Err`.
    pub fn handle_compress(codec: &dyn Codec, request: &CompressRequest) -> CompressResponse {
        let source = EncodedImage::new(request.image_bytes.clone());
        compress(codec, &source, &request.policy).into()
    }
}

pub fn parse_pixel_format(value: &str) -> Result<PixelFormat, CoreError> {
    match value.trim().to_ascii_lowercase().replace('_', "").as_str() {
        "alpha8" => Ok(PixelFormat::Alpha8),
        "argb4444" => Ok(PixelFormat::Argb4444),
        "argb8888" | "rgba8888" => Ok(PixelFormat::Argb8888),
        "rgb565" => Ok(PixelFormat::Rgb565),
        "other" => Ok(PixelFormat::Other),
        other => Err(CoreError::InvalidArgument(format!(
            "unknown pixel format '{}'; expected one of: alpha8, argb4444, argb8888, rgb565",
            other
        ))),
    }
}

pub fn parse_size_unit(value: &str) -> Result<SizeUnit, CoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "b" | "bytes" => Ok(SizeUnit::Bytes),
        "kb" => Ok(SizeUnit::Kb),
        "mb" => Ok(SizeUnit::Mb),
        "gb" => Ok(SizeUnit::Gb),
        other => Err(CoreError::InvalidArgument(format!(
            "unknown size unit '{}'; expected one of: b, kb, mb, gb",
            other
        ))),
    }
}

/// Re-encodes once at `quality`. The source image is only read.
pub fn compress_quality(codec: &dyn Codec, image: &DecodedImage, quality: u8) -> Result<EncodedImage, CoreError> {
    check_quality(quality, 0)?;
    Ok(codec.encode(image, quality)?)
}

/// Best-effort search for an encoding of at most `max_bytes`.
///
/// Stops at the first quality that fits or at quality 1, whichever comes
/// first; the result may exceed the budget.
pub fn compress_to_target_size(
    codec: &dyn Codec,
    image: &DecodedImage,
    max_bytes: u64,
    initial_quality: u8,
    schedule: StepSchedule,
) -> Result<TargetSizeOutcome, CoreError> {
    CompressionPolicy::ByTargetFileSize {
        max_bytes,
        initial_quality,
        schedule,
    }
    .validate()?;

    let mut quality = initial_quality;
    let mut attempts = 0u32;
    loop {
        let encoded = codec.encode(image, quality)?;
        attempts += 1;
        let met_target = encoded.len() as u64 <= max_bytes;
        if met_target || quality <= MIN_QUALITY {
            return Ok(TargetSizeOutcome {
                encoded,
                quality,
                attempts,
                met_target,
            });
        }
        quality = schedule.next_quality(quality);
    }
}

/// Largest power-of-two sample factor that keeps the decode at least as large as `request`.
pub fn calculate_in_sample_size(native: ImageDimensions, request: ImageDimensions) -> u32 {
    let (height, width) = (native.height(), native.width());
    let mut sample = 1u32;
    if height > request.height() || width > request.width() {
        let half_height = height / 2;
        let half_width = width / 2;
        while half_height / sample >= request.height() && half_width / sample >= request.width() {
            sample *= 2;
        }
    }
    sample
}

/// Two-phase decode: read bounds, then decode at the computed sample factor.
pub fn compress_in_sample_size(
    codec: &dyn Codec,
    source: &[u8],
    request_width: u32,
    request_height: u32,
) -> Result<SubsampleOutcome, CoreError> {
    let request = ImageDimensions::new(request_width, request_height)?;
    let native = codec.decode_bounds(source)?;
    let sample_factor = calculate_in_sample_size(native, request);
    let image = codec.decode_scaled(source, sample_factor)?;
    Ok(SubsampleOutcome {
        image,
        native,
        sample_factor,
    })
}

/// Stretches `image` onto a new `width` x `height` canvas. Aspect ratio is not kept.
pub fn resize_by_canvas(
    codec: &dyn Codec,
    image: &DecodedImage,
    width: u32,
    height: u32,
    canvas_format: PixelFormat,
) -> Result<DecodedImage, CoreError> {
    let target = ImageDimensions::new(width, height)?;
    let out = codec.fit(image, target, canvas_format, Rect::covering(target))?;
    ensure_exact(&out, target)?;
    Ok(out)
}

pub fn resize_by_scale(
    codec: &dyn Codec,
    image: &DecodedImage,
    width: u32,
    height: u32,
    smooth: bool,
) -> Result<DecodedImage, CoreError> {
    let target = ImageDimensions::new(width, height)?;
    let out = codec.scale(image, width, height, smooth)?;
    ensure_exact(&out, target)?;
    Ok(out)
}

fn ensure_exact(image: &DecodedImage, target: ImageDimensions) -> Result<(), CoreError> {
    if image.dimensions() != target {
        return Err(CoreError::Codec(format!(
            "codec produced {} instead of {}",
            image.dimensions(),
            target
        )));
    }
    Ok(())
}

pub fn compress(codec: &dyn Codec, source: &EncodedImage, policy: &CompressionPolicy) -> Result<CompressionOutcome, CoreError> {
    compress_with_telemetry(codec, source, policy, None)
}

pub fn compress_with_telemetry(
    codec: &dyn Codec,
    source: &EncodedImage,
    policy: &CompressionPolicy,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<CompressionOutcome, CoreError> {
    let start = Instant::now();
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type: TelemetryEventType::CompressStart,
            policy: policy.kind(),
            duration_ms: None,
            detail: None,
        });
    }
    let result = apply_policy(codec, source, policy);
    if let Some(sink) = telemetry {
        let (event_type, detail) = match &result {
            Ok(outcome) => (TelemetryEventType::CompressSuccess, outcome.detail()),
            Err(err) => (TelemetryEventType::CompressError, err.to_string()),
        };
        sink.emit(TelemetryEvent {
            event_type,
            policy: policy.kind(),
            duration_ms: Some(start.elapsed().as_millis() as u64),
            detail: Some(detail),
        });
    }
    result
}

fn apply_policy(codec: &dyn Codec, source: &EncodedImage, policy: &CompressionPolicy) -> Result<CompressionOutcome, CoreError> {
    policy.validate()?;
    match *policy {
        CompressionPolicy::ByQuality { quality } => {
            let image = codec.decode(source.as_bytes())?;
            let encoded = compress_quality(codec, &image, quality)?;
            Ok(CompressionOutcome::Quality { encoded, quality })
        }
        CompressionPolicy::ByTargetFileSize {
            max_bytes,
            initial_quality,
            schedule,
        } => {
            let image = codec.decode(source.as_bytes())?;
            let outcome = compress_to_target_size(codec, &image, max_bytes, initial_quality, schedule)?;
            Ok(CompressionOutcome::TargetSize(outcome))
        }
        CompressionPolicy::BySubsampledDimensions {
            request_width,
            request_height,
        } => Ok(CompressionOutcome::Subsampled(compress_in_sample_size(
            codec,
            source.as_bytes(),
            request_width,
            request_height,
        )?)),
    }
}
