use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use tracing::debug;

/// Extensions the watcher will try to decode, compared case-insensitively.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Returns `true` for `*.jpg`, `*.jpeg` and `*.png` paths in any letter case.
pub fn is_candidate_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            ACCEPTED_EXTENSIONS
                .iter()
                .any(|accepted| ext.eq_ignore_ascii_case(accepted))
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    pub attempts: u32,
    pub backoff: Duration,
    pub jpeg_quality: u8,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(20),
            jpeg_quality: 85,
        }
    }
}

/// Validate `raw` by fully decoding it and re-encode it as a baseline JPEG.
///
/// Images with an alpha channel are composited onto black; every other colour
/// type is converted to 8-bit RGB. Anything that fails to decode completely
/// (truncated, unknown format, empty) is rejected.
///
/// The JPEG decoder pads a cut-off scan instead of failing, so JPEG input must
/// also end in an EOI marker before it is decoded.
pub fn decode_frame(raw: &[u8], jpeg_quality: u8) -> Result<Vec<u8>, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    let reader = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(DecodeError::Io)?;
    if reader.format() == Some(ImageFormat::Jpeg) && !has_jpeg_end_marker(raw) {
        return Err(DecodeError::Truncated);
    }
    let img = reader.decode()?;

    let rgb = flatten_to_rgb(&img);
    encode_jpeg(&rgb, jpeg_quality)
}

/// `FF D9` as the last bytes, ignoring trailing NUL and whitespace padding.
fn has_jpeg_end_marker(raw: &[u8]) -> bool {
    let end = raw
        .iter()
        .rposition(|&b| !matches!(b, 0x00 | b' ' | b'\t' | b'\r' | b'\n'))
        .map_or(0, |i| i + 1);
    raw[..end].ends_with(&[0xFF, 0xD9])
}

fn flatten_to_rgb(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, DecodeError> {
    let mut jpeg_bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg_bytes, quality);
    encoder.encode_image(img)?;
    Ok(jpeg_bytes)
}

/// 5x7 bitmaps for the placeholder caption, one row per byte, MSB-first in
/// the low five bits.
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

fn glyph(c: char) -> [u8; 7] {
    match c {
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        _ => [0; 7],
    }
}

const PLACEHOLDER_CAPTION: &str = "NO FRAME";

/// Deterministic "no frame" image: black field, grey border, and the caption
/// "NO FRAME" centred in light grey.
pub fn placeholder_jpeg(width: u32, height: u32, quality: u8) -> Result<Vec<u8>, DecodeError> {
    let width = width.max(16);
    let height = height.max(16);
    let border = (width.min(height) / 40).max(2);
    let grey = Rgb([96u8, 96, 96]);
    let ink = Rgb([220u8, 220, 220]);

    let mut img = RgbImage::from_fn(width, height, |x, y| {
        if x < border || y < border || x >= width - border || y >= height - border {
            grey
        } else {
            Rgb([0, 0, 0])
        }
    });

    // Each glyph cell is one column wider than the glyph for spacing.
    let chars = PLACEHOLDER_CAPTION.chars().count() as u32;
    let text_cols = chars * (GLYPH_WIDTH + 1) - 1;
    let scale = (width * 3 / 5 / text_cols).min(height / 3 / GLYPH_HEIGHT).max(1);
    let left = width.saturating_sub(text_cols * scale) / 2;
    let top = height.saturating_sub(GLYPH_HEIGHT * scale) / 2;

    for (i, c) in PLACEHOLDER_CAPTION.chars().enumerate() {
        let origin_x = left + i as u32 * (GLYPH_WIDTH + 1) * scale;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let x0 = origin_x + col * scale;
                let y0 = top + row as u32 * scale;
                for y in y0..(y0 + scale).min(height) {
                    for x in x0..(x0 + scale).min(width) {
                        img.put_pixel(x, y, ink);
                    }
                }
            }
        }
    }
    encode_jpeg(&img, quality)
}

/// Read and decode `path`, retrying while the producer may still be writing it.
///
/// Gives up after `opts.attempts` tries spaced `opts.backoff` apart and
/// returns the last failure.
pub async fn load_with_retry(path: &Path, opts: &DecodeOptions) -> Result<Bytes, DecodeError> {
    let attempts = opts.attempts.max(1);
    let mut attempt = 1;
    loop {
        match read_and_decode(path, opts.jpeg_quality).await {
            Ok(jpeg) => return Ok(Bytes::from(jpeg)),
            Err(e) if attempt >= attempts => {
                return Err(DecodeError::Exhausted {
                    path: path.to_path_buf(),
                    attempts,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "decode failed, retrying");
            }
        }
        attempt += 1;
        tokio::time::sleep(opts.backoff).await;
    }
}

async fn read_and_decode(path: &Path, jpeg_quality: u8) -> Result<Vec<u8>, DecodeError> {
    let raw = tokio::fs::read(path).await.map_err(DecodeError::Io)?;
    tokio::task::spawn_blocking(move || decode_frame(&raw, jpeg_quality))
        .await
        .map_err(|e| DecodeError::Blocking(e.to_string()))?
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("file is empty")]
    Empty,
    #[error("JPEG data ends before the end-of-image marker")]
    Truncated,
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("decode task failed: {0}")]
    Blocking(String),
    #[error("giving up on {} after {attempts} attempts: {source}", .path.display())]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        source: Box<DecodeError>,
    },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    /// Encode a small solid-colour image in the given container format.
    pub(crate) fn sample_image(format: ImageFormat, rgba: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(8, 6, Rgba(rgba));
        let dynamic = match format {
            ImageFormat::Png => DynamicImage::ImageRgba8(img),
            _ => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(img).to_rgb8()),
        };
        let mut out = Cursor::new(Vec::new());
        dynamic.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    /// Baseline JPEG of deterministic noise, so the scan data is large and a
    /// cut anywhere past the headers lands inside it.
    pub(crate) fn noisy_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let h = (x.wrapping_mul(73856093) ^ y.wrapping_mul(19349663)).wrapping_mul(2654435761);
            Rgb([(h >> 24) as u8, (h >> 16) as u8, (h >> 8) as u8])
        });
        encode_jpeg(&img, 90).unwrap()
    }

    fn decode_back(jpeg: &[u8]) -> DynamicImage {
        image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg).unwrap()
    }

    #[test]
    fn candidate_extensions_are_case_insensitive() {
        assert!(is_candidate_image(Path::new("/frames/a.jpg")));
        assert!(is_candidate_image(Path::new("/frames/a.JPEG")));
        assert!(is_candidate_image(Path::new("/frames/a.Png")));
        assert!(!is_candidate_image(Path::new("/frames/a.gif")));
        assert!(!is_candidate_image(Path::new("/frames/a.jpg.tmp")));
        assert!(!is_candidate_image(Path::new("/frames/jpg")));
    }

    #[test]
    fn jpeg_input_is_reencoded() {
        let jpeg = decode_frame(&sample_image(ImageFormat::Jpeg, [200, 10, 10, 255]), 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let img = decode_back(&jpeg);
        assert_eq!((img.width(), img.height()), (8, 6));
    }

    #[test]
    fn png_alpha_is_composited_on_black() {
        let png = sample_image(ImageFormat::Png, [255, 255, 255, 0]);
        let jpeg = decode_frame(&png, 95).unwrap();
        let img = decode_back(&jpeg).to_rgb8();
        // Fully transparent white becomes (near) black after compositing.
        assert!(img.pixels().all(|p| p.0.iter().all(|&c| c < 16)));
    }

    #[test]
    fn opaque_png_keeps_colour() {
        let png = sample_image(ImageFormat::Png, [255, 255, 255, 255]);
        let img = decode_back(&decode_frame(&png, 95).unwrap()).to_rgb8();
        assert!(img.pixels().all(|p| p.0.iter().all(|&c| c > 240)));
    }

    #[test]
    fn garbage_and_truncated_input_are_rejected() {
        assert!(matches!(decode_frame(&[], 85), Err(DecodeError::Empty)));
        assert!(decode_frame(b"definitely not an image", 85).is_err());

        let png = sample_image(ImageFormat::Png, [1, 2, 3, 255]);
        let truncated = &png[..png.len() / 2];
        assert!(decode_frame(truncated, 85).is_err());
    }

    #[test]
    fn truncated_jpeg_is_rejected() {
        let jpeg = noisy_jpeg(256, 256);
        assert!(decode_frame(&jpeg, 85).is_ok());
        for cut in [jpeg.len() / 2, jpeg.len() * 2 / 3, jpeg.len() * 3 / 4, jpeg.len() - 2] {
            assert!(
                matches!(decode_frame(&jpeg[..cut], 85), Err(DecodeError::Truncated)),
                "prefix of {cut}/{} bytes was accepted",
                jpeg.len()
            );
        }
    }

    #[test]
    fn jpeg_with_trailing_padding_is_accepted() {
        let mut jpeg = noisy_jpeg(32, 32);
        jpeg.extend_from_slice(b"\r\n\0\0");
        assert!(decode_frame(&jpeg, 85).is_ok());
    }

    #[test]
    fn placeholder_is_deterministic_jpeg() {
        let a = placeholder_jpeg(640, 480, 85).unwrap();
        let b = placeholder_jpeg(640, 480, 85).unwrap();
        assert_eq!(a, b);
        let img = decode_back(&a);
        assert_eq!((img.width(), img.height()), (640, 480));
    }

    #[test]
    fn placeholder_draws_caption_in_the_middle() {
        let img = decode_back(&placeholder_jpeg(640, 480, 95).unwrap()).to_rgb8();
        let bright = |x0: u32, x1: u32, y0: u32, y1: u32| {
            (y0..y1)
                .flat_map(|y| (x0..x1).map(move |x| (x, y)))
                .filter(|&(x, y)| img.get_pixel(x, y).0[0] > 180)
                .count()
        };
        // Caption band around the centre line carries ink; the area above it
        // inside the border stays dark.
        assert!(bright(100, 540, 220, 260) > 500);
        assert_eq!(bright(100, 540, 40, 120), 0);
    }

    #[tokio::test]
    async fn load_with_retry_gives_up_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jpg");
        std::fs::write(&path, b"\xFF\xD8 truncated").unwrap();

        let opts = DecodeOptions {
            attempts: 3,
            backoff: Duration::from_millis(1),
            jpeg_quality: 85,
        };
        match load_with_retry(&path, &opts).await {
            Err(DecodeError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_with_retry_recovers_once_write_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.png");
        let png = sample_image(ImageFormat::Png, [10, 20, 30, 255]);
        std::fs::write(&path, &png[..png.len() / 3]).unwrap();

        let opts = DecodeOptions {
            attempts: 50,
            backoff: Duration::from_millis(10),
            jpeg_quality: 85,
        };
        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                tokio::fs::write(&path, &png).await.unwrap();
            })
        };
        let jpeg = load_with_retry(&path, &opts).await.unwrap();
        writer.await.unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
