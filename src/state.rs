//! Command buffer lifecycle.
//!
//! `Created -> Encoding -> Encoded -> (Enqueued) -> Committed -> {Completed | Failed}`
//!
//! Transitions are checked here, independently of Metal, so the wrappers in
//! `command` can reject misuse with a typed error instead of tripping a
//! Metal validation assert.

use crate::error::{BridgeError, Result};

/// Lifecycle state of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Fresh from the queue, nothing encoded yet.
    Created,
    /// A compute encoder is open.
    Encoding,
    /// At least one encoder was opened and closed.
    Encoded,
    /// Position in the queue reserved; no further encoding.
    Enqueued,
    /// Handed to the GPU scheduler; immutable from here on.
    Committed,
    Completed,
    Failed,
}

impl CommandBufferState {
    /// Open a compute encoder.
    pub fn begin_encoding(self) -> Result<Self> {
        match self {
            Self::Created | Self::Encoded => Ok(Self::Encoding),
            state => Err(invalid(state, "open an encoder on")),
        }
    }

    /// Close the open compute encoder.
    pub fn end_encoding(self) -> Result<Self> {
        match self {
            Self::Encoding => Ok(Self::Encoded),
            state => Err(invalid(state, "end encoding on")),
        }
    }

    pub fn enqueue(self) -> Result<Self> {
        match self {
            Self::Created | Self::Encoded => Ok(Self::Enqueued),
            state => Err(invalid(state, "enqueue")),
        }
    }

    pub fn commit(self) -> Result<Self> {
        match self {
            Self::Created | Self::Encoded | Self::Enqueued => Ok(Self::Committed),
            state => Err(invalid(state, "commit")),
        }
    }

    /// Record the GPU outcome of a committed buffer.
    pub fn finish(self, succeeded: bool) -> Result<Self> {
        match (self, succeeded) {
            (Self::Committed, true) => Ok(Self::Completed),
            (Self::Committed, false) => Ok(Self::Failed),
            (state, _) => Err(invalid(state, "complete")),
        }
    }

    /// Whether dispatches may still be appended.
    pub fn accepts_dispatches(self) -> bool {
        self == Self::Encoding
    }

    /// Whether the buffer reached `Completed` or `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

fn invalid(state: CommandBufferState, operation: &'static str) -> BridgeError {
    BridgeError::InvalidState { state, operation }
}
