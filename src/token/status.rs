//! Device status codes.
//!
//! Answers from a token use ISO 7816 status words; conditions raised by
//! the transport layer (busy, timeout, device unplugged) use small
//! negative values. The numeric values are stable so codes can be
//! compared across components and printed in logs.

use serde::{Deserialize, Serialize};

/// Status reported by a token, a transport, or the coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum StatusCode {
    /// The operation completed.
    Ok,
    /// The request had the wrong length for this device.
    WrongLength,
    /// The device answered with malformed data.
    InvalidData,
    /// A user presence gesture (touch) is required.
    WaitTouch,
    /// The key handle or challenge is not recognised by this device.
    WrongData,
    /// The transport timed out waiting for the device.
    Timeout,
    /// The device is busy serving another request.
    Busy,
    /// The device disappeared.
    Gone,
    /// Generic failure sentinel.
    Failed,
    /// Any other value, carried verbatim.
    Other(i32),
}

impl StatusCode {
    pub const OK: i32 = 0;
    pub const WRONG_LENGTH: i32 = 0x6700;
    pub const INVALID_DATA: i32 = 0x6984;
    pub const WAIT_TOUCH: i32 = 0x6985;
    pub const WRONG_DATA: i32 = 0x6a80;
    pub const TIMEOUT: i32 = -5;
    pub const BUSY: i32 = -6;
    pub const GONE: i32 = -8;
    pub const FAILED: i32 = -1;

    /// Numeric value of this status.
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => Self::OK,
            Self::WrongLength => Self::WRONG_LENGTH,
            Self::InvalidData => Self::INVALID_DATA,
            Self::WaitTouch => Self::WAIT_TOUCH,
            Self::WrongData => Self::WRONG_DATA,
            Self::Timeout => Self::TIMEOUT,
            Self::Busy => Self::BUSY,
            Self::Gone => Self::GONE,
            Self::Failed => Self::FAILED,
            Self::Other(code) => code,
        }
    }

    /// Map a numeric value back to a status. Unknown values are kept as [`StatusCode::Other`].
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::OK => Self::Ok,
            Self::WRONG_LENGTH => Self::WrongLength,
            Self::INVALID_DATA => Self::InvalidData,
            Self::WAIT_TOUCH => Self::WaitTouch,
            Self::WRONG_DATA => Self::WrongData,
            Self::TIMEOUT => Self::Timeout,
            Self::BUSY => Self::Busy,
            Self::GONE => Self::Gone,
            Self::FAILED => Self::Failed,
            other => Self::Other(other),
        }
    }

    /// Parse a status from a scenario script: a name such as `wait_touch`
    /// or a decimal / `0x` hex number.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let named = match text.to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Ok),
            "wrong_length" => Some(Self::WrongLength),
            "invalid_data" => Some(Self::InvalidData),
            "wait_touch" => Some(Self::WaitTouch),
            "wrong_data" => Some(Self::WrongData),
            "timeout" => Some(Self::Timeout),
            "busy" => Some(Self::Busy),
            "gone" => Some(Self::Gone),
            "failed" => Some(Self::Failed),
            _ => None,
        };
        if named.is_some() {
            return named;
        }

        let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => i32::from_str_radix(hex, 16).ok(),
            None => text.parse::<i32>().ok(),
        };
        parsed.map(Self::from_code)
    }

    /// Lower-case name used in logs and scenario files.
    pub fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::WrongLength => "wrong_length",
            Self::InvalidData => "invalid_data",
            Self::WaitTouch => "wait_touch",
            Self::WrongData => "wrong_data",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::Gone => "gone",
            Self::Failed => "failed",
            Self::Other(_) => "other",
        }
    }

    /// Transient conditions worth retrying on the same device.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Busy | Self::Timeout | Self::WaitTouch)
    }

    /// Answers that say "this key handle is not mine"; the device will
    /// give the same answer if asked again.
    pub fn is_not_mine(self) -> bool {
        matches!(self, Self::WrongData | Self::WrongLength)
    }
}

impl From<StatusCode> for i32 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(code) if *code < 0 => write!(f, "{code}"),
            Self::Other(code) => write!(f, "{code:#06x}"),
            named => f.write_str(named.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_back_to_variants() {
        for status in [
            StatusCode::Ok,
            StatusCode::WrongLength,
            StatusCode::InvalidData,
            StatusCode::WaitTouch,
            StatusCode::WrongData,
            StatusCode::Timeout,
            StatusCode::Busy,
            StatusCode::Gone,
            StatusCode::Failed,
        ] {
            assert_eq!(StatusCode::from_code(status.code()), status);
        }
        assert_eq!(StatusCode::from_code(0x6d00), StatusCode::Other(0x6d00));
    }

    #[test]
    fn parse_accepts_names_and_numbers() {
        assert_eq!(StatusCode::parse("wait_touch"), Some(StatusCode::WaitTouch));
        assert_eq!(StatusCode::parse(" GONE "), Some(StatusCode::Gone));
        assert_eq!(StatusCode::parse("0x6a80"), Some(StatusCode::WrongData));
        assert_eq!(StatusCode::parse("-6"), Some(StatusCode::Busy));
        assert_eq!(StatusCode::parse("0x6d00"), Some(StatusCode::Other(0x6d00)));
        assert_eq!(StatusCode::parse("touch me"), None);
    }

    #[test]
    fn display_uses_labels_and_hex_for_unknown_words() {
        assert_eq!(StatusCode::WrongData.to_string(), "wrong_data");
        assert_eq!(StatusCode::Other(0x6d00).to_string(), "0x6d00");
        assert_eq!(StatusCode::Other(-42).to_string(), "-42");
    }

    #[test]
    fn serializes_as_number() {
        let json = serde_json::to_string(&StatusCode::WaitTouch).unwrap();
        assert_eq!(json, "27013");
        let back: StatusCode = serde_json::from_str("-8").unwrap();
        assert_eq!(back, StatusCode::Gone);
    }
}
