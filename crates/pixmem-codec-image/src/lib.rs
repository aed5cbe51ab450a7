use std::env;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageReader, Rgba, RgbaImage};
use pixmem_core::{
    estimate_bytes, parse_pixel_format, Codec, CodecError, DecodedImage, EncodedImage, ImageDimensions, PixelFormat, Rect,
};

pub const DECODE_FORMAT_ENV: &str = "PIXMEM_DECODE_FORMAT";

#[derive(Debug, Clone)]
pub struct CodecDescriptor {
    pub preferred_format: PixelFormat,
}

/// `Codec` backed by the `image` crate. Decodes JPEG/PNG, encodes JPEG.
///
/// `image` cannot downscale while decoding, so `decode_scaled` decodes the
/// full-resolution RGBA frame first and samples it afterwards. Peak memory
/// during a subsampled decode is therefore the full-size frame; only the
/// returned `DecodedImage` carries the reduced footprint.
#[derive(Debug, Clone)]
pub struct ImageCrateCodec {
    descriptor: CodecDescriptor,
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self::new(PixelFormat::Argb8888)
    }
}

impl ImageCrateCodec {
    pub fn new(preferred_format: PixelFormat) -> Self {
        Self {
            descriptor: CodecDescriptor { preferred_format },
        }
    }

    /// Reads the decode format from `PIXMEM_DECODE_FORMAT`, falling back to `Argb8888`.
    pub fn from_env() -> Self {
        let format = env::var(DECODE_FORMAT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .and_then(|v| match parse_pixel_format(&v) {
                Ok(format) => Some(format),
                Err(err) => {
                    log::warn!("ignoring {}: {}", DECODE_FORMAT_ENV, err);
                    None
                }
            })
            .unwrap_or(PixelFormat::Argb8888);
        Self::new(format)
    }

    pub fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn load_rgba(&self, bytes: &[u8]) -> Result<RgbaImage, CodecError> {
        image::load_from_memory(bytes)
            .map(|img| img.to_rgba8())
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl Codec for ImageCrateCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, CodecError> {
        let rgba = self.load_rgba(bytes)?;
        pack(&rgba, self.descriptor.preferred_format)
    }

    fn decode_bounds(&self, bytes: &[u8]) -> Result<ImageDimensions, CodecError> {
        let (width, height) = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| CodecError::Decode(e.to_string()))?
            .into_dimensions()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        ImageDimensions::new(width, height).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn decode_scaled(&self, bytes: &[u8], sample_factor: u32) -> Result<DecodedImage, CodecError> {
        if sample_factor == 0 {
            return Err(CodecError::Unsupported("sample factor must be at least 1".to_string()));
        }
        let rgba = self.load_rgba(bytes)?;
        if sample_factor == 1 {
            return pack(&rgba, self.descriptor.preferred_format);
        }
        let width = (rgba.width() / sample_factor).max(1);
        let height = (rgba.height() / sample_factor).max(1);
        log::debug!(
            "subsampling {}x{} by {} to {}x{}",
            rgba.width(),
            rgba.height(),
            sample_factor,
            width,
            height
        );
        let sampled = imageops::resize(&rgba, width, height, FilterType::Nearest);
        pack(&sampled, self.descriptor.preferred_format)
    }

    fn encode(&self, image: &DecodedImage, quality: u8) -> Result<EncodedImage, CodecError> {
        let rgb = DynamicImage::ImageRgba8(unpack(image)?).to_rgb8();
        let mut out = Vec::new();
        // The JPEG encoder has no quality 0; treat it as the lowest setting.
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        log::debug!("encoded {} at quality {} into {} bytes", image.dimensions(), quality, out.len());
        Ok(EncodedImage::new(out))
    }

    fn scale(&self, image: &DecodedImage, width: u32, height: u32, smooth: bool) -> Result<DecodedImage, CodecError> {
        ImageDimensions::new(width, height).map_err(|e| CodecError::Unsupported(e.to_string()))?;
        let filter = if smooth { FilterType::Triangle } else { FilterType::Nearest };
        let resized = imageops::resize(&unpack(image)?, width, height, filter);
        pack(&resized, image.format())
    }

    fn fit(
        &self,
        image: &DecodedImage,
        canvas: ImageDimensions,
        format: PixelFormat,
        dest: Rect,
    ) -> Result<DecodedImage, CodecError> {
        let mut target = RgbaImage::from_pixel(canvas.width(), canvas.height(), Rgba([0, 0, 0, 0]));
        if dest.width > 0 && dest.height > 0 {
            let stretched = imageops::resize(&unpack(image)?, dest.width, dest.height, FilterType::Triangle);
            imageops::overlay(&mut target, &stretched, dest.x as i64, dest.y as i64);
        }
        pack(&target, format)
    }
}

/// Lays out RGBA pixels in `format`. 16-bit layouts are little-endian.
pub fn pack(rgba: &RgbaImage, format: PixelFormat) -> Result<DecodedImage, CodecError> {
    let dims = ImageDimensions::new(rgba.width(), rgba.height()).map_err(|e| CodecError::Failed(e.to_string()))?;
    let mut pixels = Vec::with_capacity(estimate_bytes(dims, format) as usize);
    for pixel in rgba.pixels() {
        let [r, g, b, a] = pixel.0;
        match format {
            PixelFormat::Alpha8 => pixels.push(a),
            PixelFormat::Argb4444 => pixels.extend_from_slice(&pack_argb4444(r, g, b, a).to_le_bytes()),
            PixelFormat::Rgb565 => pixels.extend_from_slice(&pack_rgb565(r, g, b).to_le_bytes()),
            PixelFormat::Argb8888 | PixelFormat::Other => pixels.extend_from_slice(&[r, g, b, a]),
        }
    }
    DecodedImage::new(dims, format, pixels).map_err(|e| CodecError::Failed(e.to_string()))
}

pub fn unpack(image: &DecodedImage) -> Result<RgbaImage, CodecError> {
    let bpp = image.format().bytes_per_pixel() as usize;
    let mut raw = Vec::with_capacity(image.dimensions().pixel_count() as usize * 4);
    for chunk in image.pixels().chunks_exact(bpp) {
        let rgba = match image.format() {
            PixelFormat::Alpha8 => [0, 0, 0, chunk[0]],
            PixelFormat::Argb4444 => unpack_argb4444(u16::from_le_bytes([chunk[0], chunk[1]])),
            PixelFormat::Rgb565 => unpack_rgb565(u16::from_le_bytes([chunk[0], chunk[1]])),
            PixelFormat::Argb8888 | PixelFormat::Other => [chunk[0], chunk[1], chunk[2], chunk[3]],
        };
        raw.extend_from_slice(&rgba);
    }
    RgbaImage::from_raw(image.width(), image.height(), raw)
        .ok_or_else(|| CodecError::Failed("pixel buffer does not match dimensions".to_string()))
}

fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

fn unpack_rgb565(value: u16) -> [u8; 4] {
    let r = ((value >> 11) & 0x1f) as u8;
    let g = ((value >> 5) & 0x3f) as u8;
    let b = (value & 0x1f) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2), 255]
}

fn pack_argb4444(r: u8, g: u8, b: u8, a: u8) -> u16 {
    ((r as u16 >> 4) << 12) | ((g as u16 >> 4) << 8) | ((b as u16 >> 4) << 4) | (a as u16 >> 4)
}

fn unpack_argb4444(value: u16) -> [u8; 4] {
    let nibble = |shift: u16| ((value >> shift) & 0x0f) as u8 * 17;
    [nibble(12), nibble(8), nibble(4), nibble(0)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn noisy(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let v = x.wrapping_mul(31) ^ y.wrapping_mul(17) ^ (x * y);
            Rgba([v as u8, (v >> 3) as u8, (x + y) as u8, 255])
        })
    }

    fn png_bytes(img: &RgbaImage) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img.clone())
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .expect("png encode should succeed");
        out
    }

    #[test]
    fn decode_honours_preferred_format() {
        let bytes = png_bytes(&noisy(20, 10));
        for format in PixelFormat::all() {
            let decoded = ImageCrateCodec::new(format).decode(&bytes).expect("decode should succeed");
            assert_eq!(decoded.format(), format);
            assert_eq!(decoded.dimensions(), ImageDimensions::new(20, 10).expect("dims"));
            assert_eq!(decoded.allocation_byte_count(), 200 * format.bytes_per_pixel());
        }
    }

    #[test]
    fn bounds_are_read_without_full_decode() {
        let bytes = png_bytes(&noisy(33, 7));
        let dims = ImageCrateCodec::default().decode_bounds(&bytes).expect("bounds should be readable");
        assert_eq!((dims.width(), dims.height()), (33, 7));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let codec = ImageCrateCodec::default();
        assert!(matches!(codec.decode(b"not an image"), Err(CodecError::Decode(_))));
        assert!(matches!(codec.decode_bounds(b"not an image"), Err(CodecError::Decode(_))));
    }

    #[test]
    fn scaled_decode_divides_dimensions() {
        let bytes = png_bytes(&noisy(64, 48));
        let decoded = ImageCrateCodec::new(PixelFormat::Rgb565)
            .decode_scaled(&bytes, 4)
            .expect("scaled decode should succeed");
        assert_eq!((decoded.width(), decoded.height()), (16, 12));
        assert_eq!(decoded.format(), PixelFormat::Rgb565);
    }

    #[test]
    fn lower_quality_encodes_smaller() {
        let decoded = pack(&noisy(128, 128), PixelFormat::Argb8888).expect("pack should succeed");
        let codec = ImageCrateCodec::default();
        let high = codec.encode(&decoded, 95).expect("encode should succeed");
        let low = codec.encode(&decoded, 5).expect("encode should succeed");
        assert!(low.len() < high.len());
        let back = codec.decode(low.as_bytes()).expect("jpeg should decode");
        assert_eq!(back.dimensions(), decoded.dimensions());
    }

    #[test]
    fn rgb565_keeps_primaries() {
        let img = RgbaImage::from_fn(3, 1, |x, _| match x {
            0 => Rgba([255, 0, 0, 255]),
            1 => Rgba([255, 255, 255, 255]),
            _ => Rgba([0, 0, 0, 255]),
        });
        let packed = pack(&img, PixelFormat::Rgb565).expect("pack should succeed");
        assert_eq!(unpack(&packed).expect("unpack should succeed"), img);
    }

    #[test]
    fn argb4444_rounds_to_nibbles() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([0x12, 0x34, 0x56, 0x78]));
        let packed = pack(&img, PixelFormat::Argb4444).expect("pack should succeed");
        assert_eq!(packed.pixels(), &[0x57, 0x13]);
        let back = unpack(&packed).expect("unpack should succeed");
        assert_eq!(back.get_pixel(0, 0).0, [0x11, 0x33, 0x55, 0x77]);
    }

    #[test]
    fn scale_and_fit_produce_requested_sizes() {
        let decoded = pack(&noisy(40, 10), PixelFormat::Argb8888).expect("pack should succeed");
        let codec = ImageCrateCodec::default();
        let scaled = codec.scale(&decoded, 7, 9, true).expect("scale should succeed");
        assert_eq!((scaled.width(), scaled.height()), (7, 9));
        assert_eq!(scaled.format(), PixelFormat::Argb8888);

        let canvas = ImageDimensions::new(12, 12).expect("dims");
        let fitted = codec
            .fit(&decoded, canvas, PixelFormat::Rgb565, Rect::covering(canvas))
            .expect("fit should succeed");
        assert_eq!(fitted.dimensions(), canvas);
        assert_eq!(fitted.format(), PixelFormat::Rgb565);
    }
}
