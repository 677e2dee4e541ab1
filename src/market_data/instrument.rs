use std::fmt;

use serde::{Deserialize, Serialize};

/// A listed security: ticker plus the exchange it trades on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub exchange: String,
}

impl Instrument {
    pub fn new(symbol: impl AsRef<str>, exchange: impl AsRef<str>) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            exchange: exchange.as_ref().trim().to_uppercase(),
        }
    }

    /// Filesystem-safe form, e.g. `XEQT-TSX`.
    pub fn storage_key(&self) -> String {
        format!("{}-{}", sanitize(&self.symbol), sanitize(&self.exchange))
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        let instrument = Instrument::new(" xeqt ", "tsx");
        assert_eq!(instrument, Instrument::new("XEQT", "TSX"));
        assert_eq!(instrument.to_string(), "TSX:XEQT");
    }

    #[test]
    fn storage_key_is_path_safe() {
        let instrument = Instrument::new("BRK.B", "NYSE");
        assert_eq!(instrument.storage_key(), "BRK_B-NYSE");
        let venture = Instrument::new("ABC", "TSX-V");
        assert_eq!(venture.storage_key(), "ABC-TSX_V");
    }
}
