use serde::{Deserialize, Serialize};
use thiserror::Error;

/// In-memory pixel layout of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PixelFormat {
    Alpha8,
    Argb4444,
    Argb8888,
    Rgb565,
    /// Any layout the accountant does not know; sized like `Argb8888`.
    Other,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            Self::Alpha8 => 1,
            Self::Argb4444 => 2,
            Self::Argb8888 => 4,
            Self::Rgb565 => 2,
            Self::Other => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Alpha8 => "alpha8",
            Self::Argb4444 => "argb4444",
            Self::Argb8888 => "argb8888",
            Self::Rgb565 => "rgb565",
            Self::Other => "other",
        }
    }

    pub fn all() -> [PixelFormat; 5] {
        [Self::Alpha8, Self::Argb4444, Self::Argb8888, Self::Rgb565, Self::Other]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeUnit {
    Bytes,
    Kb,
    Mb,
    Gb,
}

impl SizeUnit {
    pub fn divisor(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kb => 1024,
            Self::Mb => 1024 * 1024,
            Self::Gb => 1024 * 1024 * 1024,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Bytes => "b",
            Self::Kb => "kb",
            Self::Mb => "mb",
            Self::Gb => "gb",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DimensionError {
    #[error("image dimensions must be positive (got {width}x{height})")]
    NonPositive { width: u32, height: u32 },
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferLength { expected: u64, actual: u64 },
}

/// Width and height of an image, both strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDimensions")]
pub struct ImageDimensions {
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
struct RawDimensions {
    width: u32,
    height: u32,
}

impl TryFrom<RawDimensions> for ImageDimensions {
    type Error = DimensionError;

    fn try_from(raw: RawDimensions) -> Result<Self, Self::Error> {
        Self::new(raw.width, raw.height)
    }
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32) -> Result<Self, DimensionError> {
        if width == 0 || height == 0 {
            return Err(DimensionError::NonPositive { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> u64 {
        (self.width as u64) * (self.height as u64)
    }
}

impl std::fmt::Display for ImageDimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

pub fn bytes_per_pixel(format: PixelFormat) -> u64 {
    format.bytes_per_pixel()
}

/// Bytes a decoder allocates for an image of `dims` in `format`.
///
/// Accumulates in 64 bits and saturates instead of wrapping.
pub fn estimate_bytes(dims: ImageDimensions, format: PixelFormat) -> u64 {
    dims.pixel_count().saturating_mul(format.bytes_per_pixel())
}

/// Floor-divides a byte count into `unit`.
pub fn convert(bytes: u64, unit: SizeUnit) -> u64 {
    bytes / unit.divisor()
}

/// Size of an encoded buffer (or file contents) expressed in `unit`.
pub fn encoded_size(bytes: &[u8], unit: SizeUnit) -> u64 {
    convert(bytes.len() as u64, unit)
}

/// Checks an estimate against the allocation a codec actually reported.
pub fn footprint_matches(dims: ImageDimensions, format: PixelFormat, allocated: u64) -> bool {
    estimate_bytes(dims, format) == allocated
}

/// Validates that a raw pixel buffer is exactly as large as the estimate.
pub fn check_buffer_len(dims: ImageDimensions, format: PixelFormat, len: usize) -> Result<(), DimensionError> {
    let expected = estimate_bytes(dims, format);
    if expected != len as u64 {
        return Err(DimensionError::BufferLength {
            expected,
            actual: len as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dims(width: u32, height: u32) -> ImageDimensions {
        ImageDimensions::new(width, height).expect("dimensions should be positive")
    }

    #[test]
    fn rgb565_square_reports_bytes_and_kb() {
        let bytes = estimate_bytes(dims(100, 100), PixelFormat::Rgb565);
        assert_eq!(bytes, 20_000);
        assert_eq!(convert(bytes, SizeUnit::Kb), 19);
    }

    #[test]
    fn other_format_falls_back_to_four_bytes() {
        assert_eq!(bytes_per_pixel(PixelFormat::Other), 4);
        assert_eq!(
            estimate_bytes(dims(3, 7), PixelFormat::Other),
            estimate_bytes(dims(3, 7), PixelFormat::Argb8888)
        );
    }

    #[test]
    fn zero_sized_dimensions_are_rejected() {
        assert_eq!(
            ImageDimensions::new(0, 10),
            Err(DimensionError::NonPositive { width: 0, height: 10 })
        );
        assert!(ImageDimensions::new(10, 0).is_err());
    }

    #[test]
    fn large_images_do_not_wrap() {
        let bytes = estimate_bytes(dims(100_000, 100_000), PixelFormat::Argb8888);
        assert_eq!(bytes, 40_000_000_000);
        assert_eq!(convert(bytes, SizeUnit::Gb), 37);
    }

    #[test]
    fn extreme_dimensions_saturate() {
        let bytes = estimate_bytes(dims(u32::MAX, u32::MAX), PixelFormat::Argb8888);
        assert_eq!(bytes, u64::MAX);
    }

    #[test]
    fn deserializing_zero_width_fails() {
        let parsed: Result<ImageDimensions, _> = serde_json::from_str("{\"width\":0,\"height\":4}");
        assert!(parsed.is_err());
    }

    #[test]
    fn buffer_length_mismatch_is_reported() {
        let err = check_buffer_len(dims(2, 2), PixelFormat::Rgb565, 6).expect_err("length should mismatch");
        assert_eq!(err, DimensionError::BufferLength { expected: 8, actual: 6 });
        assert!(check_buffer_len(dims(2, 2), PixelFormat::Rgb565, 8).is_ok());
    }

    #[test]
    fn encoded_size_uses_buffer_length() {
        let buf = vec![0u8; 5 * 1024 + 1023];
        assert_eq!(encoded_size(&buf, SizeUnit::Kb), 5);
        assert_eq!(encoded_size(&buf, SizeUnit::Bytes), 6143);
        assert_eq!(encoded_size(&[], SizeUnit::Mb), 0);
    }

    fn any_format() -> impl Strategy<Value = PixelFormat> {
        prop::sample::select(PixelFormat::all().to_vec())
    }

    fn any_unit() -> impl Strategy<Value = SizeUnit> {
        prop::sample::select(vec![SizeUnit::Bytes, SizeUnit::Kb, SizeUnit::Mb, SizeUnit::Gb])
    }

    proptest! {
        #[test]
        fn estimate_is_width_times_height_times_bpp(w in 1u32..20_000, h in 1u32..20_000, format in any_format()) {
            let expected = w as u64 * h as u64 * bytes_per_pixel(format);
            prop_assert_eq!(estimate_bytes(dims(w, h), format), expected);
            prop_assert!(footprint_matches(dims(w, h), format, expected));
        }

        #[test]
        fn kb_conversion_is_floor_division(bytes in any::<u64>()) {
            prop_assert_eq!(convert(bytes, SizeUnit::Kb), bytes / 1024);
            prop_assert_eq!(convert(bytes, SizeUnit::Mb), bytes / 1024 / 1024);
            prop_assert_eq!(convert(bytes, SizeUnit::Bytes), bytes);
        }

        #[test]
        fn zero_bytes_convert_to_zero(unit in any_unit()) {
            prop_assert_eq!(convert(0, unit), 0);
        }
    }
}
