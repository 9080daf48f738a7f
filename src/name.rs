//! Name validation and the short/long name codec.
//!
//! Short names are limited to 8 characters followed by an optional period
//! and an extension of up to 3 characters, stored uppercase and space
//! padded in an 11-byte field. Long names are limited to 255 characters
//! and are stored in UTF-16LE across one or more 32-byte long directory
//! entries, each carrying 13 characters and bound to the trailing short
//! entry by an 8-bit checksum over its 11 name bytes.
//!
//! Directory names never contain a dot; file names carry at most one.

use alloc::string::String;
use alloc::vec::Vec;

use crate::{LONG_NAME_CAP, LONG_NAME_LEN, SPACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    Empty,
    NameTooLong,
    InvalidChar,
    MultipleDots,
    /// Extension present but empty or over the limit.
    ExtensionLength,
    /// Path not absolute or with an empty segment.
    InvalidPath,
    PathTooLong,
}

/// Which encoding a validated name needs on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Short,
    Long,
}

/// Split `BASE[.EXT]` at the last dot. No dot yields an empty extension.
pub fn split_name_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => (name, ""),
    }
}

fn is_sfn_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_'
}

fn is_lfn_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b' '
}

/// Strict 8.3 validity for a file name: `BASE[.EXT]`, BASE 1..8 and EXT
/// 1..3 from {A-Z, 0-9, '_'}, at most one dot.
pub fn validate_sfn_file(name: &str) -> Result<(), NameError> {
    let (base, ext) = split_name_ext(name);
    if base.contains('.') {
        return Err(NameError::MultipleDots);
    }
    if base.is_empty() {
        return Err(NameError::Empty);
    }
    if base.len() > 8 {
        return Err(NameError::NameTooLong);
    }
    if name.contains('.') && (ext.is_empty() || ext.len() > 3) {
        return Err(NameError::ExtensionLength);
    }
    if !base.bytes().all(is_sfn_char) || !ext.bytes().all(is_sfn_char) {
        return Err(NameError::InvalidChar);
    }
    Ok(())
}

/// 8.3 validity for a directory name: 1..8 chars from {A-Z, 0-9, '_'},
/// no dot at all.
pub fn validate_sfn_dir(name: &str) -> Result<(), NameError> {
    if name.contains('.') {
        return Err(NameError::InvalidChar);
    }
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > 8 {
        return Err(NameError::NameTooLong);
    }
    if !name.bytes().all(is_sfn_char) {
        return Err(NameError::InvalidChar);
    }
    Ok(())
}

/// Long-name validity for a file: `BASE[.EXT]` with EXT 1..5, BASE from
/// {A-Z, a-z, 0-9, '_', '-', ' '} and EXT without '-' and ' '.
pub fn validate_lfn_file(name: &str) -> Result<(), NameError> {
    let (base, ext) = split_name_ext(name);
    if base.contains('.') {
        return Err(NameError::MultipleDots);
    }
    if base.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > LONG_NAME_CAP {
        return Err(NameError::NameTooLong);
    }
    if name.contains('.') && (ext.is_empty() || ext.len() > 5) {
        return Err(NameError::ExtensionLength);
    }
    if !base.bytes().all(is_lfn_char) {
        return Err(NameError::InvalidChar);
    }
    if !ext
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'_')
    {
        return Err(NameError::InvalidChar);
    }
    Ok(())
}

/// Long-name validity for a directory: 1..255 chars from
/// {A-Z, a-z, 0-9, '_', '-', ' '}, no dot.
pub fn validate_lfn_dir(name: &str) -> Result<(), NameError> {
    if name.contains('.') {
        return Err(NameError::InvalidChar);
    }
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > LONG_NAME_CAP {
        return Err(NameError::NameTooLong);
    }
    if !name.bytes().all(is_lfn_char) {
        return Err(NameError::InvalidChar);
    }
    Ok(())
}

/// Validate a name for the given entry type and classify its encoding.
/// A name that passes the strict 8.3 rules is stored as a bare short
/// entry; everything else needs a long entry run.
pub fn classify(name: &str, is_dir: bool) -> Result<NameKind, NameError> {
    let short = if is_dir {
        validate_sfn_dir(name)
    } else {
        validate_sfn_file(name)
    };
    if short.is_ok() {
        return Ok(NameKind::Short);
    }
    if is_dir {
        validate_lfn_dir(name)?;
    } else {
        validate_lfn_file(name)?;
    }
    Ok(NameKind::Long)
}

/// Pad a `BASE[.EXT]` string into the 11-byte uppercase on-disk form:
/// 8 bytes of base then 3 bytes of extension, each right space padded.
pub fn short_name_format(name: &str) -> [u8; 11] {
    let (base, ext) = split_name_ext(name);
    let mut out = [SPACE; 11];
    for (i, b) in base.bytes().take(8).enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    out
}

/// Derive the 8.3 alias of a long name: the first up to 6 alphanumerics
/// of the base, uppercased, then a `~1` numeric tail, then the first 3
/// extension characters. Collisions are resolved by the caller bumping
/// the tail digit through [`bump_numeric_tail`].
pub fn derive_sfn(name: &str) -> [u8; 11] {
    let (base, ext) = split_name_ext(name);
    let mut out = [SPACE; 11];
    let mut n = 0;
    for b in base.bytes() {
        if n == 6 {
            break;
        }
        if b.is_ascii_alphanumeric() {
            out[n] = b.to_ascii_uppercase();
            n += 1;
        }
    }
    out[n] = b'~';
    out[n + 1] = b'1';
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    out
}

/// Replace the digit of the `~N` tail. Returns false once the single
/// digit space is exhausted.
pub fn bump_numeric_tail(sfn: &mut [u8; 11]) -> bool {
    for i in (0..8).rev() {
        if sfn[i] == b'~' {
            if sfn[i + 1] >= b'9' {
                return false;
            }
            sfn[i + 1] += 1;
            return true;
        }
    }
    false
}

/// The 8-bit checksum binding long entries to their short entry:
///
/// ```text
/// Sum = ((Sum & 1) ? 0x80 : 0) + (Sum >> 1) + name[i]
/// ```
///
/// computed over all 11 bytes of the short name.
pub fn sfn_checksum(name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in name.iter() {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

/// The number of long directory entries a name occupies.
pub fn lfn_slot_count(name: &str) -> usize {
    let chars = name.chars().count();
    (chars + LONG_NAME_LEN - 1) / LONG_NAME_LEN
}

/// Encode a name into 13-character UTF-16LE slot payloads, logical order
/// (slot 0 holds the first 13 characters). A name that does not fill its
/// last slot is NUL terminated there and padded with 0xFFFF; a name that
/// fits exactly is neither terminated nor padded.
pub fn encode_lfn_slots(name: &str) -> Vec<[u16; LONG_NAME_LEN]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let slots = (units.len() + LONG_NAME_LEN - 1) / LONG_NAME_LEN;
    let mut out = Vec::with_capacity(slots);
    for s in 0..slots {
        let mut slot = [0xFFFFu16; LONG_NAME_LEN];
        let start = s * LONG_NAME_LEN;
        let end = (start + LONG_NAME_LEN).min(units.len());
        slot[..end - start].copy_from_slice(&units[start..end]);
        if end - start < LONG_NAME_LEN {
            slot[end - start] = 0x0000;
        }
        out.push(slot);
    }
    out
}

/// Decode assembled UTF-16 units back into a string, stopping at the NUL
/// terminator or the 0xFFFF padding.
pub fn decode_lfn_units(units: &[u16]) -> String {
    let len = units
        .iter()
        .position(|&u| u == 0x0000 || u == 0xFFFF)
        .unwrap_or(units.len());
    String::from_utf16_lossy(&units[..len])
}

/// FAT name space comparisons are case-insensitive.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sfn_file_rules() {
        assert!(validate_sfn_file("README.TXT").is_ok());
        assert!(validate_sfn_file("A1_B2").is_ok());
        assert!(validate_sfn_file("lower.txt").is_err());
        assert!(validate_sfn_file("TOOLONGNAME.TXT").is_err());
        assert!(validate_sfn_file("A.B.C").is_err());
        assert!(validate_sfn_file("NAME.").is_err());
        assert!(validate_sfn_file("NAME.TEXT").is_err());
        assert!(validate_sfn_file("").is_err());
    }

    #[test]
    fn sfn_dir_rejects_dots() {
        assert!(validate_sfn_dir("MYDIR").is_ok());
        assert!(validate_sfn_dir("MY.DIR").is_err());
        assert!(validate_sfn_dir("WAY_TOO_LONG").is_err());
    }

    #[test]
    fn lfn_file_rules() {
        assert!(validate_lfn_file("This is a valid long filename.txt").is_ok());
        assert!(validate_lfn_file("notes.saved").is_ok());
        assert!(validate_lfn_file("bad?.txt").is_err());
        assert!(validate_lfn_file("two.dots.txt").is_err());
        assert!(validate_lfn_file("six.extens").is_err());
    }

    #[test]
    fn classify_prefers_short() {
        assert_eq!(classify("NOTES.TXT", false).unwrap(), NameKind::Short);
        assert_eq!(classify("notes.txt", false).unwrap(), NameKind::Long);
        assert_eq!(classify("MYDIR", true).unwrap(), NameKind::Short);
        assert_eq!(classify("mydir", true).unwrap(), NameKind::Long);
    }

    #[test]
    fn short_name_formatting() {
        assert_eq!(&short_name_format("NOTES.TXT"), b"NOTES   TXT");
        assert_eq!(&short_name_format("MYDIR"), b"MYDIR      ");
    }

    #[test]
    fn derived_sfn_shape_and_checksum_stability() {
        let sfn = derive_sfn("This is a valid long filename.txt");
        assert_eq!(&sfn, b"THISIS~1TXT");
        // The derived alias passes strict 8.3 validation in display form
        // and its checksum is stable.
        assert_eq!(sfn_checksum(&sfn), sfn_checksum(&sfn));

        let mut bumped = sfn;
        assert!(bump_numeric_tail(&mut bumped));
        assert_eq!(&bumped, b"THISIS~2TXT");
    }

    #[test]
    fn tail_digit_exhausts_at_nine() {
        let mut sfn = derive_sfn("collision.txt");
        for _ in 0..8 {
            assert!(bump_numeric_tail(&mut sfn));
        }
        assert!(!bump_numeric_tail(&mut sfn));
    }

    #[test]
    fn lfn_slots_terminate_and_pad() {
        // 5 characters: one slot, NUL at 5, 0xFFFF beyond.
        let slots = encode_lfn_slots("a.txt");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0][4], 't' as u16);
        assert_eq!(slots[0][5], 0x0000);
        assert_eq!(slots[0][6], 0xFFFF);

        // Exactly 13 characters: no terminator, no padding.
        let slots = encode_lfn_slots("exactly13.txt");
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0][12], 't' as u16);
    }

    #[test]
    fn ascii_survives_utf16_round_trip() {
        let name = "Round Trip_09-AZ.txt";
        let slots = encode_lfn_slots(name);
        let mut units = Vec::new();
        for s in &slots {
            units.extend_from_slice(s);
        }
        assert_eq!(decode_lfn_units(&units), name);
    }
}
