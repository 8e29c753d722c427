use crate::{frame::FrameHeader, function::ChannelFunction, Result};

/// Mask/unmask a buffer that starts at a multiple of 4 in the payload.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast32(buf, mask);
}

/// Mask/unmask a buffer that starts `offset` bytes into the payload.
#[inline]
pub fn apply_mask_at(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    let mut rotated = mask;
    rotated.rotate_left(offset & 3);
    apply_mask_fast32(buf, rotated);
}

#[inline]
fn apply_mask_bytewise(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Operates on 4-byte words once the buffer is aligned.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_bytewise(prefix, mask);

    let mut word_mask = mask;
    word_mask.rotate_left(prefix.len() & 3);
    let word_mask_u32 = u32::from_ne_bytes(word_mask);
    for word in words.iter_mut() {
        *word ^= word_mask_u32;
    }

    // words are a multiple of 4, so the suffix starts at the same phase as the words
    apply_mask_bytewise(suffix, word_mask);
}

/// Unmasks a payload that is read in arbitrary pieces.
///
/// The masker remembers how many payload bytes it has seen, so a read that stops in the
/// middle of a 4-byte block is picked up at the right key offset.
#[derive(Debug, Clone)]
pub struct Masker {
    key: [u8; 4],
    offset: usize,
}

impl Masker {
    pub fn new(key: [u8; 4]) -> Self {
        Self { key, offset: 0 }
    }

    #[inline]
    pub fn key(&self) -> [u8; 4] {
        self.key
    }

    /// Unmasks the next piece of payload in place.
    pub fn unmask(&mut self, buf: &mut [u8]) {
        apply_mask_at(buf, self.key, self.offset);
        self.offset = (self.offset + buf.len()) & 3;
    }
}

impl ChannelFunction for Masker {
    fn new_frame(&mut self, header: &FrameHeader) {
        if let Some(key) = header.mask {
            self.key = key;
        }
        self.offset = 0;
    }

    fn after_read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.unmask(buf);
        Ok(())
    }

    fn complete(&mut self, _header: &FrameHeader) -> Result<()> {
        self.offset = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(data: &[u8], mask: [u8; 4]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4])
            .collect()
    }

    #[test]
    fn test_fast_path_matches_reference() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        let data: Vec<u8> = (0..67u8).map(|i| i.wrapping_mul(37)).collect();

        for start in 0..4 {
            let mut buf = data.clone();
            apply_mask(&mut buf[start..], mask);
            assert_eq!(&buf[start..], &reference(&data[start..], mask)[..]);
        }
    }

    #[test]
    fn test_double_mask_is_identity() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"masking twice restores the payload".to_vec();

        let mut data = original.clone();
        apply_mask(&mut data, mask);
        assert_ne!(data, original);
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_at_offset() {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let data = b"abcdefghij".to_vec();
        let expected = reference(&data, mask);

        for offset in 0..data.len() {
            let mut tail = data[offset..].to_vec();
            apply_mask_at(&mut tail, mask, offset);
            assert_eq!(&tail[..], &expected[offset..]);
        }
    }

    #[test]
    fn test_masker_partial_reads() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let data: Vec<u8> = (0..100u8).collect();
        let expected = reference(&data, mask);

        for piece in 1..9 {
            let mut masker = Masker::new(mask);
            let mut out = Vec::new();
            for chunk in data.chunks(piece) {
                let mut chunk = chunk.to_vec();
                masker.unmask(&mut chunk);
                out.extend_from_slice(&chunk);
            }
            assert_eq!(out, expected, "piece size {piece}");
        }
    }

    #[test]
    fn test_masker_resets_per_frame() {
        let mut masker = Masker::new([0; 4]);
        let header = crate::frame::FrameHeader::new(true, crate::frame::FrameType::Binary, 3)
            .with_mask(Some([0xFF, 0x00, 0xFF, 0x00]));
        masker.new_frame(&header);

        let mut buf = [0u8; 3];
        masker.after_read(&mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0x00, 0xFF]);
        masker.complete(&header).unwrap();
        assert_eq!(masker.offset, 0);
    }
}
