//! Legacy and REX prefix scan.

use crate::core::instruction::{PrefixMask, MAX_INST_LENGTH};

/// Prefix breakdown of one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixInfo {
    pub num_prefix_bytes: u8,
    pub mask: PrefixMask,
    pub num_rex_prefixes: u8,
    pub rex: u8,
    pub rex_index: Option<u8>,
    pub has_duplicates: bool,
    pub has_ambig_segments: bool,
}

impl PrefixInfo {
    /// Prefix bytes that are not REX.
    pub fn num_legacy_bytes(&self) -> u8 {
        self.num_prefix_bytes - self.num_rex_prefixes
    }

    /// True when every legacy prefix is in `allowed` and no REX is present.
    pub fn only_uses(&self, allowed: PrefixMask) -> bool {
        self.num_rex_prefixes == 0 && allowed.contains(self.mask)
    }
}

fn prefix_bit(byte: u8) -> Option<PrefixMask> {
    let bit = match byte {
        0xf0 => PrefixMask::LOCK,
        0xf2 => PrefixMask::REPNE,
        0xf3 => PrefixMask::REP,
        0x2e => PrefixMask::SEG_CS,
        0x36 => PrefixMask::SEG_SS,
        0x3e => PrefixMask::SEG_DS,
        0x26 => PrefixMask::SEG_ES,
        0x64 => PrefixMask::SEG_FS,
        0x65 => PrefixMask::SEG_GS,
        0x66 => PrefixMask::DATA16,
        0x67 => PrefixMask::ADDR16,
        0x40..=0x4f => PrefixMask::REX,
        _ => return None,
    };
    Some(bit)
}

/// Scan the prefix bytes at the start of `bytes`.
pub fn scan_prefixes(bytes: &[u8]) -> PrefixInfo {
    let mut info = PrefixInfo::default();
    // An instruction needs at least one opcode byte after its prefixes.
    let limit = bytes.len().min(MAX_INST_LENGTH).saturating_sub(1);

    for (i, &byte) in bytes.iter().enumerate().take(limit) {
        let Some(bit) = prefix_bit(byte) else {
            break;
        };
        if info.mask.contains(bit) {
            info.has_duplicates = true;
        }
        if PrefixMask::SEGMENTS.contains(bit) && info.mask.intersects(PrefixMask::SEGMENTS - bit) {
            info.has_ambig_segments = true;
        }
        if bit == PrefixMask::REX {
            info.num_rex_prefixes += 1;
            info.rex = byte;
            info.rex_index = Some(i as u8);
        }
        info.mask |= bit;
        info.num_prefix_bytes += 1;
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_prefixes() {
        let info = scan_prefixes(&[0x90]);
        assert_eq!(info.num_prefix_bytes, 0);
        assert!(info.mask.is_empty());
    }

    #[test]
    fn rex_w() {
        let info = scan_prefixes(&[0x48, 0x01, 0xc4]);
        assert_eq!(info.num_prefix_bytes, 1);
        assert_eq!(info.num_rex_prefixes, 1);
        assert_eq!(info.rex, 0x48);
        assert_eq!(info.rex_index, Some(0));
        assert_eq!(info.num_legacy_bytes(), 0);
    }

    #[test]
    fn duplicates_and_segments() {
        let info = scan_prefixes(&[0x66, 0x66, 0x90]);
        assert!(info.has_duplicates);
        assert!(!info.has_ambig_segments);

        let info = scan_prefixes(&[0x2e, 0x64, 0x8b, 0x00]);
        assert!(info.has_ambig_segments);
        assert!(!info.has_duplicates);
        assert!(info.mask.contains(PrefixMask::SEG_CS | PrefixMask::SEG_FS));
    }

    #[test]
    fn rex_before_legacy() {
        let info = scan_prefixes(&[0x48, 0x66, 0x90]);
        assert_eq!(info.num_prefix_bytes, 2);
        assert_eq!(info.rex_index, Some(0));
    }

    #[test]
    fn all_prefix_bytes_is_bounded() {
        let info = scan_prefixes(&[0x66; 20]);
        assert_eq!(info.num_prefix_bytes as usize, MAX_INST_LENGTH - 1);
    }

    #[test]
    fn padding_nop_prefixes() {
        let info = scan_prefixes(&[0x66, 0x2e, 0x0f, 0x1f, 0x84, 0, 0, 0, 0, 0]);
        assert!(info.only_uses(PrefixMask::DATA16 | PrefixMask::SEG_CS));
        assert!(!scan_prefixes(&[0x48, 0x90]).only_uses(PrefixMask::DATA16));
    }
}
