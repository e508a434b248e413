//! Filename sanitization for storage keys
//!
//! Every storage operation is keyed by a filename that originated in an HTTP
//! request. `SafeFileName` is the only way to obtain such a key, so code that
//! touches the chunk store cannot accidentally use a raw client string.

use std::fmt;

use crate::upload::types::UploadError;

/// Maximum byte length for a sanitized filename
const MAX_NAME_BYTES: usize = 255;

/// Windows device names that cannot be used as file stems
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// A filename that is safe to use as a storage key.
///
/// Sanitization is pure and deterministic: the same input always maps to the
/// same key, so retried and concurrent uploads of one logical file agree on
/// where its artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafeFileName(String);

impl SafeFileName {
    /// Sanitize a raw client-supplied filename into a storage key.
    ///
    /// Path separators, reserved characters and control characters are
    /// replaced with `_`; trailing dots and spaces are trimmed; Windows
    /// device names get a `_` suffix; the result is capped at 255 bytes.
    /// Names that are empty after sanitization are rejected.
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        let mut name = String::with_capacity(raw.len());
        for ch in raw.trim().chars() {
            let mapped = match ch {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            };
            name.push(mapped);
        }

        // Trailing dots and spaces are dropped by Windows filesystems, which
        // would make distinct keys collide.
        while name.ends_with('.') || name.ends_with(' ') {
            name.pop();
        }

        if name.is_empty() {
            return Err(UploadError::FilenameRequired);
        }

        let stem = name.split('.').next().unwrap_or("");
        if RESERVED_NAMES
            .iter()
            .any(|r| stem.eq_ignore_ascii_case(r))
        {
            name.push('_');
        }

        if name.len() > MAX_NAME_BYTES {
            let mut cut = MAX_NAME_BYTES;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }

        Ok(Self(name))
    }

    /// The sanitized name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SafeFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        let name = SafeFileName::parse("report.pdf").unwrap();
        assert_eq!(name.as_str(), "report.pdf");
    }

    #[test]
    fn sanitization_is_deterministic() {
        let a = SafeFileName::parse("a/b:c.txt").unwrap();
        let b = SafeFileName::parse("a/b:c.txt").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn path_separators_are_replaced() {
        let name = SafeFileName::parse("../../etc/passwd").unwrap();
        assert!(!name.as_str().contains('/'));
        assert!(!name.as_str().contains('\\'));
        assert_eq!(name.as_str(), ".._.._etc_passwd");
    }

    #[test]
    fn windows_reserved_chars_are_replaced() {
        let name = SafeFileName::parse("a<b>c:d|e?f*g\"h.bin").unwrap();
        assert_eq!(name.as_str(), "a_b_c_d_e_f_g_h.bin");
    }

    #[test]
    fn control_chars_are_replaced() {
        let name = SafeFileName::parse("a\u{0}b\nc.txt").unwrap();
        assert_eq!(name.as_str(), "a_b_c.txt");
    }

    #[test]
    fn trailing_dots_and_spaces_are_trimmed() {
        let name = SafeFileName::parse("notes.txt. . ").unwrap();
        assert_eq!(name.as_str(), "notes.txt");
    }

    #[test]
    fn empty_and_dot_only_names_are_rejected() {
        assert!(matches!(
            SafeFileName::parse(""),
            Err(UploadError::FilenameRequired)
        ));
        assert!(matches!(
            SafeFileName::parse("   "),
            Err(UploadError::FilenameRequired)
        ));
        assert!(matches!(
            SafeFileName::parse("."),
            Err(UploadError::FilenameRequired)
        ));
        assert!(matches!(
            SafeFileName::parse(".."),
            Err(UploadError::FilenameRequired)
        ));
    }

    #[test]
    fn reserved_device_names_are_suffixed() {
        let name = SafeFileName::parse("CON").unwrap();
        assert_eq!(name.as_str(), "CON_");
        let name = SafeFileName::parse("nul.txt").unwrap();
        assert_eq!(name.as_str(), "nul.txt_");
    }

    #[test]
    fn long_names_are_capped_at_a_char_boundary() {
        let raw = "é".repeat(200);
        let name = SafeFileName::parse(&raw).unwrap();
        assert!(name.as_str().len() <= 255);
        assert!(name.as_str().is_char_boundary(name.as_str().len()));
    }
}
