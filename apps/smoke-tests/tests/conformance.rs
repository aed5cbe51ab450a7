use anyhow::Result;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use pixmem_codec_image::ImageCrateCodec;
use pixmem_core::{
    compress, estimate_bytes, resize_by_canvas, resize_by_scale, Codec, CompressionConfig, CompressionOutcome, CompressionPolicy,
    CoreError, EncodedImage, ErrorCode, ImageDimensions, PixelFormat,
};

fn build_sample_jpeg(width: u32, height: u32) -> Result<EncodedImage> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let v = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
        Rgb([(v >> 8) as u8, (v >> 16) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Jpeg)?;
    Ok(EncodedImage::new(out))
}

fn dims(width: u32, height: u32) -> ImageDimensions {
    ImageDimensions::new(width, height).expect("dimensions should be positive")
}

#[test]
fn subsampling_shrinks_footprint_by_square_of_factor() -> Result<()> {
    let codec = ImageCrateCodec::new(PixelFormat::Rgb565);
    let source = build_sample_jpeg(1200, 900)?;
    let full = codec.decode(source.as_bytes())?;

    let outcome = compress(
        &codec,
        &source,
        &CompressionPolicy::BySubsampledDimensions {
            request_width: 300,
            request_height: 300,
        },
    )?;
    let CompressionOutcome::Subsampled(sub) = outcome else {
        panic!("expected a subsampled outcome");
    };
    assert_eq!(sub.sample_factor, 2);
    assert_eq!(sub.native, dims(1200, 900));
    assert_eq!(sub.image.dimensions(), dims(600, 450));
    assert_eq!(sub.image.allocation_byte_count() * 4, full.allocation_byte_count());
    assert_eq!(sub.image.allocation_byte_count(), 600 * 450 * 2);
    Ok(())
}

#[test]
fn quality_compression_keeps_decoded_shape() -> Result<()> {
    let codec = ImageCrateCodec::new(PixelFormat::Argb8888);
    let source = build_sample_jpeg(320, 240)?;
    let decoded = codec.decode(source.as_bytes())?;
    let baseline = codec.encode(&decoded, 100)?;

    let outcome = compress(&codec, &source, &CompressionPolicy::ByQuality { quality: 10 })?;
    let encoded = outcome.encoded().expect("quality policy yields bytes");
    assert!(encoded.len() < baseline.len());

    let roundtrip = codec.decode(encoded.as_bytes())?;
    assert_eq!(roundtrip.dimensions(), decoded.dimensions());
    assert_eq!(roundtrip.format(), decoded.format());
    assert_eq!(roundtrip.allocation_byte_count(), decoded.allocation_byte_count());
    Ok(())
}

#[test]
fn target_size_search_is_bounded() -> Result<()> {
    let codec = ImageCrateCodec::default();
    let source = build_sample_jpeg(256, 256)?;

    let outcome = compress(&codec, &source, &CompressionPolicy::by_target_file_size(1))?;
    let CompressionOutcome::TargetSize(tight) = outcome else {
        panic!("expected a target-size outcome");
    };
    assert!(!tight.met_target);
    assert_eq!(tight.quality, 1);
    assert_eq!(tight.attempts, 18);

    let outcome = compress(&codec, &source, &CompressionPolicy::by_target_file_size(10 * 1024 * 1024))?;
    let CompressionOutcome::TargetSize(loose) = outcome else {
        panic!("expected a target-size outcome");
    };
    assert!(loose.met_target);
    assert_eq!(loose.attempts, 1);
    assert_eq!(loose.quality, 90);
    Ok(())
}

#[test]
fn exact_resizes_ignore_aspect_ratio() -> Result<()> {
    let codec = ImageCrateCodec::default();
    let source = codec.decode(build_sample_jpeg(400, 100)?.as_bytes())?;

    let scaled = resize_by_scale(&codec, &source, 300, 300, true)?;
    assert_eq!(scaled.dimensions(), dims(300, 300));

    let canvas = resize_by_canvas(&codec, &source, 300, 300, PixelFormat::Rgb565)?;
    assert_eq!(canvas.dimensions(), dims(300, 300));
    assert_eq!(canvas.allocation_byte_count(), estimate_bytes(dims(300, 300), PixelFormat::Rgb565));
    Ok(())
}

#[test]
fn estimate_matches_codec_allocation_for_every_format() -> Result<()> {
    let source = build_sample_jpeg(100, 100)?;
    for format in PixelFormat::all() {
        let decoded = ImageCrateCodec::new(format).decode(source.as_bytes())?;
        assert_eq!(decoded.allocation_byte_count(), estimate_bytes(decoded.dimensions(), format));
    }
    let rgb565 = ImageCrateCodec::new(PixelFormat::Rgb565).decode(source.as_bytes())?;
    assert_eq!(rgb565.allocation_byte_count(), 20_000);
    Ok(())
}

#[test]
fn truncated_input_reports_decode_error() -> Result<()> {
    let codec = ImageCrateCodec::default();
    let source = build_sample_jpeg(64, 64)?;
    let truncated = EncodedImage::new(source.as_bytes()[..20].to_vec());
    let err = compress(&codec, &truncated, &CompressionPolicy::ByQuality { quality: 50 })
        .expect_err("truncated jpeg should not decode");
    assert!(matches!(err, CoreError::Decode(_)));
    let info = serde_json::to_value(err.as_error_info())?;
    assert_eq!(info["code"], "decode-error");
    assert_eq!(err.as_error_info().code, ErrorCode::DecodeError);
    Ok(())
}

#[test]
fn config_file_drives_policy_selection() -> Result<()> {
    let cfg: CompressionConfig = serde_json::from_str(r#"{"mode":"sample","requestWidth":150,"requestHeight":100}"#)?;
    assert_eq!(cfg.preferred_format()?, PixelFormat::Rgb565);
    let policy = cfg.to_policy()?;
    assert_eq!(
        policy,
        CompressionPolicy::BySubsampledDimensions {
            request_width: 150,
            request_height: 100
        }
    );

    let codec = ImageCrateCodec::new(cfg.preferred_format()?);
    let outcome = compress(&codec, &build_sample_jpeg(640, 480)?, &policy)?;
    assert_eq!(outcome.summary().sample_factor, Some(4));
    assert_eq!(outcome.decoded().map(|d| d.dimensions()), Some(dims(160, 120)));
    Ok(())
}
