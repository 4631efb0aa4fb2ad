//! Text decoding fallback for servers reporting an ASCII-only encoding.
//!
//! A `SQL_ASCII` server stores whatever bytes clients sent it, so text
//! columns may hold UTF-8, Latin-1, windows-1252, Shift_JIS or a mix. The
//! decoder tries each configured encoding in order and degrades to lossy
//! UTF-8. Encoding names are resolved through `encoding_rs` labels, with
//! Python-style spellings (`shift_jis`, `euc_jp`, `latin-1`) accepted too.

use std::fmt;
use std::str::FromStr;

use encoding_rs::Encoding;

use crate::error::PoolError;

/// Server encodings that trigger installation of the fallback decoder.
const ASCII_ENCODINGS: [&str; 3] = ["ascii", "sqlascii", "sql_ascii"];

/// Column types whose values are routed through the fallback decoder.
pub const TEXT_TYPES: [&str; 6] = ["text", "varchar", "name", "regclass", "bpchar", "unknown"];

/// Whether a server-reported encoding name is one of the ASCII-only aliases.
pub fn is_ascii_encoding(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ASCII_ENCODINGS.contains(&lower.as_str())
}

/// Whether values of the named column type are text-bearing.
pub fn is_text_type(type_name: &str) -> bool {
    TEXT_TYPES.contains(&type_name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// ISO-8859-1 proper. `encoding_rs` maps the `latin1` label to
    /// windows-1252, which differs in 0x80..=0x9F.
    Latin1,
    Ascii,
    /// Any other WHATWG encoding (windows-1252, Shift_JIS, GBK, EUC-KR, ...).
    Other(&'static Encoding),
}

impl TextEncoding {
    /// Decode `bytes`, or `None` if they are not valid in this encoding.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            // Every byte maps to the code point of the same value.
            TextEncoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
            TextEncoding::Ascii => bytes
                .is_ascii()
                .then(|| bytes.iter().map(|&b| b as char).collect()),
            TextEncoding::Other(encoding) => encoding
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| text.into_owned()),
        }
    }

    fn lookup(label: &str) -> Option<&'static Encoding> {
        Encoding::for_label_no_replacement(label.as_bytes())
            .or_else(|| Encoding::for_label_no_replacement(label.replace('_', "-").as_bytes()))
            .or_else(|| Encoding::for_label_no_replacement(label.replace('-', "_").as_bytes()))
    }
}

impl FromStr for TextEncoding {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_ascii_lowercase();
        match label.as_str() {
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "iso_8859_1" => {
                return Ok(TextEncoding::Latin1);
            }
            "ascii" | "us-ascii" => return Ok(TextEncoding::Ascii),
            _ => {}
        }
        match Self::lookup(&label) {
            Some(encoding) if encoding == encoding_rs::UTF_8 => Ok(TextEncoding::Utf8),
            Some(encoding) => Ok(TextEncoding::Other(encoding)),
            None => Err(PoolError::Config(format!("unknown text encoding: {s}"))),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "utf-8"),
            TextEncoding::Latin1 => write!(f, "latin-1"),
            TextEncoding::Ascii => write!(f, "ascii"),
            TextEncoding::Other(encoding) => write!(f, "{}", encoding.name().to_ascii_lowercase()),
        }
    }
}

/// Ordered list of encodings to try for text-bearing columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextDecoder {
    encodings: Vec<TextEncoding>,
}

impl Default for TextDecoder {
    fn default() -> Self {
        Self {
            encodings: vec![TextEncoding::Utf8],
        }
    }
}

impl TextDecoder {
    pub fn new(encodings: Vec<TextEncoding>) -> Self {
        if encodings.is_empty() {
            return Self::default();
        }
        Self { encodings }
    }

    /// Parse encoding names; `None` yields the default decoder.
    pub fn from_names(names: Option<&[String]>) -> Result<Self, PoolError> {
        match names {
            None => Ok(Self::default()),
            Some(names) => names
                .iter()
                .map(|name| name.parse())
                .collect::<Result<Vec<_>, _>>()
                .map(Self::new),
        }
    }

    pub fn encodings(&self) -> &[TextEncoding] {
        &self.encodings
    }

    /// Whether values of the named column type go through this decoder.
    pub fn handles_type(&self, type_name: &str) -> bool {
        is_text_type(type_name)
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        self.encodings
            .iter()
            .find_map(|encoding| encoding.decode(bytes))
            .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned())
    }
}
