//! Trailing halt trimming.
//!
//! A segment that ends the code region is often padded with a long run of
//! halts. Validating that padding is pointless, so the run is cut down to a
//! safety margin, rounded up to a bundle boundary when the segment allows.

use crate::core::instruction::{HALT_OPCODE, MAX_INST_LENGTH};

/// Halts always kept after the last non-halt byte.
pub const MIN_HALT_KEEP_LENGTH: u64 = MAX_INST_LENGTH as u64 + 1;

/// Size of `segment` once its trailing halts are trimmed.
pub fn trimmed_size(segment: &[u8], vbase: u64, alignment: u64) -> u64 {
    let size = segment.len() as u64;
    if size == 0 {
        return 0;
    }
    // The first byte is never counted as padding.
    let kept = segment[1..]
        .iter()
        .rposition(|b| *b != HALT_OPCODE)
        .map_or(1, |i| i as u64 + 2);
    let halts = size - kept;
    if halts <= MIN_HALT_KEEP_LENGTH {
        return size;
    }

    let mut end = vbase + kept + MIN_HALT_KEEP_LENGTH;
    let overflow = end % alignment;
    if overflow != 0 {
        let rounded = end + alignment - overflow;
        if rounded >= vbase + size {
            return size;
        }
        end = rounded;
    }
    end - vbase
}

/// Trim a segment that reaches `vlimit`, returning the new size and limit.
/// Segments that stop short of the limit are left alone.
pub fn trim_segment(segment: &[u8], vbase: u64, alignment: u64, vlimit: u64) -> (u64, u64) {
    let size = segment.len() as u64;
    if vlimit != vbase + size {
        return (size, vlimit);
    }
    let trimmed = trimmed_size(segment, vbase, alignment);
    if trimmed != size {
        tracing::debug!(
            vbase = %format_args!("{:x}", vbase),
            size,
            trimmed,
            "trimmed trailing halts"
        );
    }
    (trimmed, vlimit - (size - trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(code: &[u8], total: usize) -> Vec<u8> {
        let mut bytes = code.to_vec();
        bytes.resize(total, HALT_OPCODE);
        bytes
    }

    #[test]
    fn short_padding_is_kept() {
        let bytes = segment(&[0x90; 32], 48);
        assert_eq!(trimmed_size(&bytes, 0, 32), 48);
    }

    #[test]
    fn long_padding_is_trimmed_to_bundle() {
        let bytes = segment(&[0x90; 32], 128);
        // 32 code bytes + 16 halts, rounded up to 64.
        assert_eq!(trimmed_size(&bytes, 0, 32), 64);
        assert_eq!(trim_segment(&bytes, 0, 32, 128), (64, 64));
    }

    #[test]
    fn aligned_end_needs_no_rounding() {
        let bytes = segment(&[0x90; 16], 256);
        assert_eq!(trimmed_size(&bytes, 0, 32), 32);
    }

    #[test]
    fn rounding_past_end_gives_up() {
        let bytes = segment(&[0x90; 32], 60);
        assert_eq!(trimmed_size(&bytes, 0, 32), 60);
    }

    #[test]
    fn first_byte_is_never_padding() {
        let bytes = vec![HALT_OPCODE; 64];
        // kept = 1, end = 17 rounded to 32.
        assert_eq!(trimmed_size(&bytes, 0, 32), 32);
    }

    #[test]
    fn inner_segment_untouched() {
        let bytes = segment(&[0x90; 32], 128);
        assert_eq!(trim_segment(&bytes, 0, 32, 0x1000), (128, 0x1000));
    }
}
