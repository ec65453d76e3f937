//! Configurable text encodings for header and body text.
//!
//! RFC 3261 messages are UTF-8, but a fair amount of deployed equipment still
//! emits ISO-8859-1 header values. The transport decodes header text and body
//! text independently, each under one of these encodings.

/// Text encoding applied when turning wire bytes into header or body text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    /// RFC 3261 default.
    #[default]
    Utf8,
    /// ISO-8859-1 interop mode: every byte maps 1:1 to U+00..U+FF.
    Latin1,
}

impl TextEncoding {
    /// Decodes raw bytes into text. Returns `None` when the bytes are not
    /// valid in this encoding (Latin-1 decoding never fails).
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            TextEncoding::Latin1 => Some(bytes.iter().map(|b| *b as char).collect()),
        }
    }

    /// Encodes text into wire bytes. Characters outside Latin-1 are replaced
    /// with `?` in Latin-1 mode.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
                .collect(),
        }
    }
}
