use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Separator between the path identifier and the relative part of a file
/// reference, e.g. `shows::seq010/shot020.blend`.
pub const FILE_REF_SEPARATOR: &str = "::";

/// A unit of assigned work.
///
/// Frame jobs hand out one frame at a time; video jobs hand the whole
/// inclusive range to a single node. On the wire a single frame is a bare
/// integer and a range is a two element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameSpec {
    Single(i64),
    Range(i64, i64),
}

impl FrameSpec {
    /// First frame covered.
    pub fn first(&self) -> i64 {
        match *self {
            FrameSpec::Single(f) => f,
            FrameSpec::Range(first, _) => first,
        }
    }

    /// Last frame covered (inclusive).
    pub fn last(&self) -> i64 {
        match *self {
            FrameSpec::Single(f) => f,
            FrameSpec::Range(_, last) => last,
        }
    }

    /// Number of frames covered; an inverted range covers nothing.
    /// Saturates at `u64::MAX` for the full `i64` span.
    pub fn len(&self) -> u64 {
        let (first, last) = (self.first(), self.last());
        if last < first {
            0
        } else {
            last.abs_diff(first).saturating_add(1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_range(&self) -> bool {
        matches!(self, FrameSpec::Range(..))
    }

    /// Every frame number covered, in ascending order.
    pub fn frames(&self) -> impl Iterator<Item = i64> + use<> {
        self.first()..=self.last()
    }
}

impl fmt::Display for FrameSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSpec::Single(frame) => write!(f, "{frame}"),
            FrameSpec::Range(first, last) => write!(f, "{first}-{last}"),
        }
    }
}

/// Split a file reference into `(path identifier, relative path)`.
pub fn split_file_ref(file: &str) -> Option<(&str, &str)> {
    file.split_once(FILE_REF_SEPARATOR)
}

/// Current Unix time in fractional seconds.
pub fn epoch_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
