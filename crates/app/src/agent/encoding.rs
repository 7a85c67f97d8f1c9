//! Frame conversion and transport encoding for the `video-frame` event.

use anyhow::{Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use video_ingest::{Frame, FrameFormat};

/// Copy a captured BGR frame into an RGB image.
pub fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    if frame.width <= 0 || frame.height <= 0 {
        bail!("frame has no pixels ({}x{})", frame.width, frame.height);
    }
    let width = frame.width as u32;
    let height = frame.height as u32;
    let expected = width as usize * height as usize * frame.format.bytes_per_pixel();
    if frame.data.len() < expected {
        bail!(
            "frame buffer too short: {} bytes for {}x{}",
            frame.data.len(),
            width,
            height
        );
    }

    let rgb = match frame.format {
        FrameFormat::Bgr8 => bgr_to_rgb(&frame.data[..expected]),
    };
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// JPEG at `quality`, then standard base64.
pub fn encode_for_transport(image: &RgbImage, quality: u8) -> Result<String> {
    let jpeg = encode_jpeg(image, quality)?;
    Ok(general_purpose::STANDARD.encode(jpeg))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn frame(width: i32, height: i32, bgr: [u8; 3]) -> Frame {
        let data = bgr.repeat((width * height) as usize);
        Frame {
            data,
            width,
            height,
            format: FrameFormat::Bgr8,
            sequence: 1,
            timestamp_ms: 0,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn swaps_channels() {
        let image = frame_to_rgb(&frame(2, 2, [10, 20, 30])).expect("convert");
        assert_eq!(image.get_pixel(1, 1).0, [30, 20, 10]);
    }

    #[test]
    fn rejects_truncated_buffers() {
        let mut short = frame(4, 4, [0, 0, 0]);
        short.data.truncate(10);
        assert!(frame_to_rgb(&short).is_err());
    }

    #[test]
    fn transport_string_is_a_base64_jpeg() {
        let image = frame_to_rgb(&frame(16, 8, [0, 0, 255])).expect("convert");
        let encoded = encode_for_transport(&image, 80).expect("encode");

        let bytes = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .expect("valid base64");
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}
