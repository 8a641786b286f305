//! Transport encoding of annotated camera frames.
//!
//! Layout (all integers little endian):
//!
//! ```text
//! "MCFP" | version u8 | frame_number u64 | camera_count u32
//! per camera: id_len u16 | id utf-8 | width u32 | height u32 | channels u8 | pixel_len u32 | pixels
//! ```

use anyhow::{anyhow, Context, Result};

use crate::frame::RawFrame;
use crate::message::Observation;
use crate::{CameraId, FrameNumber};

pub const MAGIC: &[u8; 4] = b"MCFP";
pub const VERSION: u8 = 1;

const MARKER_ARM: i64 = 4;
const MARKER_VALUE: u8 = 255;

/// One camera image ready for transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportFrame {
    pub camera_id: CameraId,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportFrames {
    pub frame_number: FrameNumber,
    pub frames: Vec<TransportFrame>,
}

/// Copy the frame and draw a crosshair at every observed point.
///
/// The source frame is never modified. Points outside the image are skipped.
pub fn annotate(frame: &RawFrame, observations: &[&Observation]) -> TransportFrame {
    let view = frame.view();
    let (width, height, channels) = (view.width(), view.height(), view.channels());
    let mut pixels = frame.to_pixels();
    let mut paint = |x: i64, y: i64| {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            return;
        }
        let offset = (y as usize * width as usize + x as usize) * channels as usize;
        pixels[offset..offset + channels as usize].fill(MARKER_VALUE);
    };
    for observation in observations {
        for point in observation.points.values() {
            if !point.x.is_finite() || !point.y.is_finite() {
                continue;
            }
            let (cx, cy) = (point.x.round() as i64, point.y.round() as i64);
            for d in -MARKER_ARM..=MARKER_ARM {
                paint(cx + d, cy);
                paint(cx, cy + d);
            }
        }
    }
    TransportFrame {
        camera_id: view.camera_id().to_string(),
        width,
        height,
        channels,
        pixels,
    }
}

pub fn encode_frames(frame_number: FrameNumber, frames: &[TransportFrame]) -> Result<Vec<u8>> {
    let pixel_bytes: usize = frames.iter().map(|f| f.pixels.len() + f.camera_id.len() + 19).sum();
    let mut out = Vec::with_capacity(17 + pixel_bytes);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&frame_number.to_le_bytes());
    let count = u32::try_from(frames.len()).context("too many cameras for one payload")?;
    out.extend_from_slice(&count.to_le_bytes());
    for frame in frames {
        let id_len = u16::try_from(frame.camera_id.len())
            .with_context(|| format!("camera id {} too long", frame.camera_id))?;
        let pixel_len = u32::try_from(frame.pixels.len())
            .with_context(|| format!("frame of camera {} too large", frame.camera_id))?;
        out.extend_from_slice(&id_len.to_le_bytes());
        out.extend_from_slice(frame.camera_id.as_bytes());
        out.extend_from_slice(&frame.width.to_le_bytes());
        out.extend_from_slice(&frame.height.to_le_bytes());
        out.push(frame.channels);
        out.extend_from_slice(&pixel_len.to_le_bytes());
        out.extend_from_slice(&frame.pixels);
    }
    Ok(out)
}

pub fn decode_frames(bytes: &[u8]) -> Result<TransportFrames> {
    let mut reader = Reader { bytes, pos: 0 };
    if reader.take(4)? != MAGIC {
        return Err(anyhow!("not a frame payload (bad magic)"));
    }
    let version = reader.u8()?;
    if version != VERSION {
        return Err(anyhow!("unsupported frame payload version {}", version));
    }
    let frame_number = u64::from_le_bytes(reader.array()?);
    let count = u32::from_le_bytes(reader.array()?);
    let mut frames = Vec::new();
    for _ in 0..count {
        let id_len = u16::from_le_bytes(reader.array()?) as usize;
        let camera_id = std::str::from_utf8(reader.take(id_len)?)
            .context("camera id is not utf-8")?
            .to_string();
        let width = u32::from_le_bytes(reader.array()?);
        let height = u32::from_le_bytes(reader.array()?);
        let channels = reader.u8()?;
        let pixel_len = u32::from_le_bytes(reader.array()?) as usize;
        let pixels = reader.take(pixel_len)?.to_vec();
        frames.push(TransportFrame {
            camera_id,
            width,
            height,
            channels,
            pixels,
        });
    }
    if reader.pos != bytes.len() {
        return Err(anyhow!(
            "{} trailing bytes after frame payload",
            bytes.len() - reader.pos
        ));
    }
    Ok(TransportFrames {
        frame_number,
        frames,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| anyhow!("frame payload truncated at byte {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(camera_id: &str) -> TransportFrame {
        TransportFrame {
            camera_id: camera_id.to_string(),
            width: 2,
            height: 1,
            channels: 3,
            pixels: vec![1, 2, 3, 4, 5, 6],
        }
    }

    #[test]
    fn layout_is_stable() {
        let bytes = encode_frames(0x0102, &[frame("ab")]).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(b"MCFP");
        expected.push(1);
        expected.extend_from_slice(&[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        expected.extend_from_slice(&[1, 0, 0, 0]);
        expected.extend_from_slice(&[2, 0]);
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&[2, 0, 0, 0]);
        expected.extend_from_slice(&[1, 0, 0, 0]);
        expected.push(3);
        expected.extend_from_slice(&[6, 0, 0, 0]);
        expected.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(bytes, expected);

        let decoded = decode_frames(&bytes).unwrap();
        assert_eq!(decoded.frame_number, 0x0102);
        assert_eq!(decoded.frames, vec![frame("ab")]);
    }

    #[test]
    fn decode_rejects_damaged_input() {
        let bytes = encode_frames(7, &[frame("0"), frame("1")]).unwrap();
        assert!(decode_frames(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_frames(b"XXXX").is_err());

        let mut extra = bytes.clone();
        extra.push(0);
        assert!(decode_frames(&extra).is_err());

        let mut wrong_version = bytes;
        wrong_version[4] = 9;
        assert!(decode_frames(&wrong_version).is_err());
    }

    #[test]
    fn annotate_draws_crosshair_without_touching_source() {
        let raw = RawFrame::new("0", 3, 16, 16, 1, vec![0; 256]).unwrap();
        let obs = Observation::new().with_point("p", 8.0, 8.0).with_point("edge", 0.0, 15.0);
        let annotated = annotate(&raw, &[&obs]);

        let at = |x: usize, y: usize| annotated.pixels[y * 16 + x];
        assert_eq!(at(8, 8), 255);
        assert_eq!(at(4, 8), 255);
        assert_eq!(at(8, 12), 255);
        assert_eq!(at(3, 8), 0);
        assert_eq!(at(9, 9), 0);
        assert_eq!(at(0, 15), 255);
        assert_eq!(at(4, 15), 255);
        assert!(raw.view().pixels().iter().all(|p| *p == 0));
        assert_eq!(annotated.camera_id, "0");
    }
}
