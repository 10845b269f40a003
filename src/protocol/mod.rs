//! Wire-level request/response envelopes exchanged with the device agents

pub mod envelope;

pub use envelope::RequestType;
