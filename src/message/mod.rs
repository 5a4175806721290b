//! Typed records carried over the queues and their wire envelope.

pub mod envelope;
pub mod job;

pub use envelope::{decode, encode, Envelope, DATA_TYPE, ENVELOPE_VERSION};
pub use job::{JobDescription, JobKey, ResultMessage, Score};
