//! Job and result records exchanged over the queues.
//!
//! - `JobKey`: composite identifier grouping every variant of one sky pixel
//! - `JobDescription`: one unit of reconstruction work
//! - `ResultMessage`: the scored output of one job
//! - `Score`: goodness-of-fit metric where NaN marks a failed fit

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifies one spatial cell at one resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Resolution level of the pixelization.
    pub nside: u32,
    /// Cell index at that resolution.
    pub pixel: u64,
}

impl JobKey {
    pub fn new(nside: u32, pixel: u64) -> Self {
        Self { nside, pixel }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(nside={}, pixel={})", self.nside, self.pixel)
    }
}

/// Goodness-of-fit metric. Lower is better; NaN signals a failed fit.
///
/// On the wire an undefined score is encoded as `null`, since JSON has no NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score(f64);

impl Score {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    /// A score for a fit that failed.
    pub fn undefined() -> Self {
        Self(f64::NAN)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_defined(&self) -> bool {
        !self.0.is_nan()
    }

    /// Returns true when `self` is a strictly better fit than `other`.
    ///
    /// Undefined scores are never better than anything.
    pub fn is_better_than(&self, other: &Score) -> bool {
        if !self.is_defined() {
            return false;
        }
        if !other.is_defined() {
            return true;
        }
        self.0.partial_cmp(&other.0) == Some(Ordering::Less)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_defined() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "nan")
        }
    }
}

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_defined() {
            serializer.serialize_some(&self.0)
        } else {
            serializer.serialize_none()
        }
    }
}

impl<'de> Deserialize<'de> for Score {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.map(Score::new).unwrap_or_else(Score::undefined))
    }
}

/// Opaque bytes carried through the pipeline untouched, base64 on the wire.
mod opaque_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A unit of reconstruction work: one pixel, one position variant.
///
/// Created by the producer and consumed by exactly one successful worker
/// invocation, though it may be redelivered after a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_key: JobKey,
    /// Position variant, in `0..K`.
    pub variant: u32,
    /// Reconstruction input, never interpreted by this crate.
    #[serde(with = "opaque_bytes")]
    pub payload: Vec<u8>,
}

impl JobDescription {
    pub fn new(job_key: JobKey, variant: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_key,
            variant,
            payload: payload.into(),
        }
    }

    /// Builds the result record for this job.
    pub fn into_result(self, score: Score, payload: Vec<u8>) -> ResultMessage {
        ResultMessage {
            job_key: self.job_key,
            variant: self.variant,
            score,
            payload,
        }
    }
}

/// The scored output of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub job_key: JobKey,
    pub variant: u32,
    pub score: Score,
    /// Reconstruction output, never interpreted by this crate.
    #[serde(with = "opaque_bytes")]
    pub payload: Vec<u8>,
}

impl ResultMessage {
    pub fn new(job_key: JobKey, variant: u32, score: Score, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_key,
            variant,
            score,
            payload: payload.into(),
        }
    }
}
