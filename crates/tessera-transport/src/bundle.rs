//! # Encoded-Frame Bundles
//!
//! One encoder output can consist of several encoded units (e.g. NAL
//! groups). They cross the codec boundary as a single buffer:
//!
//! ```text
//! count: u32 LE | size[0]: u32 LE | ... | size[count-1]: u32 LE | bytes[0] | ... | bytes[count-1]
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Result, TransportError};

/// Encoded size of a bundle holding `frames`.
pub fn bundle_size<B: AsRef<[u8]>>(frames: &[B]) -> usize {
    4 + 4 * frames.len() + frames.iter().map(|f| f.as_ref().len()).sum::<usize>()
}

/// Serialize `frames` into the front of `buf`, returning the bytes written.
/// Fails without writing anything if the bundle does not fit.
pub fn write_bundle<B: AsRef<[u8]>>(frames: &[B], buf: &mut [u8]) -> Result<usize> {
    let needed = bundle_size(frames);
    if needed > buf.len() {
        return Err(TransportError::PacketTooLarge {
            size: needed,
            max: buf.len(),
        });
    }
    if frames.len() > u32::MAX as usize || frames.iter().any(|f| f.as_ref().len() > u32::MAX as usize) {
        return Err(TransportError::Malformed("bundle length field"));
    }

    let mut out = &mut buf[..needed];
    out.put_u32_le(frames.len() as u32);
    for frame in frames {
        out.put_u32_le(frame.as_ref().len() as u32);
    }
    for frame in frames {
        out.put_slice(frame.as_ref());
    }
    Ok(needed)
}

/// Split a bundle back into its units. The returned slices share `buf`.
pub fn extract_bundle(buf: &Bytes) -> Result<Vec<Bytes>> {
    let mut header = &buf[..];
    if header.remaining() < 4 {
        return Err(TransportError::Malformed("bundle header"));
    }
    let count = header.get_u32_le() as usize;
    if count > header.remaining() / 4 {
        return Err(TransportError::Malformed("bundle header"));
    }
    let sizes: Vec<usize> = (0..count).map(|_| header.get_u32_le() as usize).collect();

    let mut offset = 4 + 4 * count;
    let mut frames = Vec::with_capacity(count);
    for size in sizes {
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= buf.len())
            .ok_or(TransportError::Malformed("bundle frame size"))?;
        frames.push(buf.slice(offset..end));
        offset = end;
    }
    Ok(frames)
}
