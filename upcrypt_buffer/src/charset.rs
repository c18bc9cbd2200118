use std::{fmt, str::FromStr};

use crate::Error;

/// Charset assumed for text when the content type doesn't name one.
pub const DEFAULT_CHARSET: Charset = Charset::Iso8859_1;

/// Character encodings text content can be decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Iso8859_1,
    UsAscii,
}

impl Charset {
    /// Decodes `bytes`, replacing anything malformed with U+FFFD.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Iso8859_1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Charset::UsAscii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { char::from(b) } else { char::REPLACEMENT_CHARACTER })
                .collect(),
        }
    }
}

impl FromStr for Charset {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "iso8859-1" | "iso_8859_1" | "iso8859_1" | "latin1" | "l1" => {
                Ok(Charset::Iso8859_1)
            }
            "us-ascii" | "ascii" => Ok(Charset::UsAscii),
            _ => Err(Error::UnsupportedCharset(name.to_string())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Charset::Utf8 => "UTF-8",
            Charset::Iso8859_1 => "ISO-8859-1",
            Charset::UsAscii => "US-ASCII",
        })
    }
}

/// Value of the `charset` parameter in a content type such as
/// `text/plain; charset="UTF-8"`, lowercased.
pub(crate) fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}
