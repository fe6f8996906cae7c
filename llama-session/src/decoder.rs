//! Incremental UTF-8 decoding of token pieces.
//!
//! A token's bytes may end in the middle of a multi-byte character. The
//! decoder holds such a suffix back until the following pieces complete it, so
//! callers only ever see whole characters.

/// Buffers incomplete UTF-8 suffixes between pushes.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes waiting for the rest of their character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Feed one piece, returning every character that is now complete.
    ///
    /// Byte sequences that can never become valid UTF-8 are emitted as U+FFFD.
    /// A suffix that may still be completed is never emitted.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // from_utf8 already checked this prefix
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    consumed += valid;
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += invalid;
                        }
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        out
    }

    /// End of stream. Returns how many incomplete bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"hello"), "hello");
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_split_character_is_held_back() {
        let euro = "€".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&euro[..1]), "");
        assert_eq!(decoder.push(&euro[1..2]), "");
        assert_eq!(decoder.pending().len(), 2);
        assert_eq!(decoder.push(&euro[2..]), "€");
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_complete_prefix_emitted_before_partial_suffix() {
        let text = "a😀";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&bytes[..3]), "a");
        assert_eq!(decoder.push(&bytes[3..]), "😀");
    }

    #[test]
    fn test_invalid_bytes_become_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'x', 0xFF, b'y']), "x\u{FFFD}y");
    }

    #[test]
    fn test_finish_drops_incomplete_tail() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&"é".as_bytes()[..1]), "");
        assert_eq!(decoder.finish(), 1);
        assert_eq!(decoder.push(b"ok"), "ok");
    }
}
