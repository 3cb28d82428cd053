//! Synthetic media source.
//!
//! Stands in for an encoder: every tick it produces one bundled video frame
//! whose size follows the bitrate the client last asked for, plus one audio
//! chunk.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tessera_transport::bundle::{bundle_size, write_bundle};

/// Parameter-set sized units that lead every frame.
const HEADER_UNITS: [usize; 2] = [24, 8];
const MIN_FRAME_SIZE: usize = 64;
/// 10 ms of 48 kHz stereo Opus at ~128 kbit/s.
pub const AUDIO_CHUNK_SIZE: usize = 160;

pub struct SyntheticSource {
    fps: u32,
    bitrate: Arc<AtomicU32>,
    max_frame_size: usize,
    next_video_id: i32,
    next_audio_id: i32,
    buf: Vec<u8>,
}

impl SyntheticSource {
    pub fn new(fps: u32, bitrate: Arc<AtomicU32>, max_frame_size: usize) -> Self {
        SyntheticSource {
            fps: fps.max(1),
            bitrate,
            max_frame_size: max_frame_size.max(MIN_FRAME_SIZE),
            next_video_id: 0,
            next_audio_id: 0,
            buf: Vec::new(),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Size the encoder would emit at the current bitrate.
    pub fn frame_size(&self) -> usize {
        let bytes = self.bitrate.load(Ordering::Relaxed) as usize / 8 / self.fps as usize;
        bytes.clamp(MIN_FRAME_SIZE, self.max_frame_size)
    }

    /// Next video frame as an encoded-frame bundle.
    pub fn next_video(&mut self) -> anyhow::Result<(i32, &[u8])> {
        let id = self.next_video_id;
        self.next_video_id = self.next_video_id.wrapping_add(1);

        let header: usize = HEADER_UNITS.iter().sum::<usize>() + 4 + 4 * (HEADER_UNITS.len() + 1);
        let slice_len = self.frame_size().saturating_sub(header).max(1);
        let fill = (id & 0xFF) as u8;
        let units: Vec<Vec<u8>> = HEADER_UNITS
            .iter()
            .map(|&n| vec![fill; n])
            .chain(std::iter::once(vec![fill; slice_len]))
            .collect();

        self.buf.resize(bundle_size(&units), 0);
        let n = write_bundle(&units, &mut self.buf)?;
        Ok((id, &self.buf[..n]))
    }

    pub fn next_audio(&mut self) -> (i32, [u8; AUDIO_CHUNK_SIZE]) {
        let id = self.next_audio_id;
        self.next_audio_id = self.next_audio_id.wrapping_add(1);
        (id, [(id & 0xFF) as u8; AUDIO_CHUNK_SIZE])
    }
}
