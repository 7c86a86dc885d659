//! # Status
//!
//! Classification of FTP reply codes per RFC 959

use std::fmt;

/// The five RFC 959 reply classes, derived from the first digit of the
/// 3-digit reply code. Command outcomes are matched on the class alone;
/// the full code stays available on the [`crate::types::Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 1xx: the requested action is being initiated, expect another reply
    PositivePreliminary,
    /// 2xx: the requested action has completed
    PositiveCompletion,
    /// 3xx: command accepted, waiting for further information
    PositiveIntermediate,
    /// 4xx: action not taken, but the condition is temporary
    TransientNegative,
    /// 5xx: action not taken, do not repeat the request
    PermanentNegative,
}

impl ReplyClass {
    /// Classify a reply code. Returns `None` for codes outside 100..=599.
    pub fn of(code: u32) -> Option<Self> {
        match code / 100 {
            1 => Some(Self::PositivePreliminary),
            2 => Some(Self::PositiveCompletion),
            3 => Some(Self::PositiveIntermediate),
            4 => Some(Self::TransientNegative),
            5 => Some(Self::PermanentNegative),
            _ => None,
        }
    }

    /// The first digit of the codes in this class.
    pub fn digit(&self) -> u8 {
        match self {
            Self::PositivePreliminary => 1,
            Self::PositiveCompletion => 2,
            Self::PositiveIntermediate => 3,
            Self::TransientNegative => 4,
            Self::PermanentNegative => 5,
        }
    }

    /// Whether the class reports a failure (4xx or 5xx).
    pub fn is_negative(&self) -> bool {
        matches!(self, Self::TransientNegative | Self::PermanentNegative)
    }
}

impl fmt::Display for ReplyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}xx", self.digit())
    }
}
