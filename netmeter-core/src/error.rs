// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error kinds per spec.md §7.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("socket setup failed: {0}")]
    SocketSetup(String),

    #[error("transient transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("acknowledge timed out after {0:?}")]
    AckTimeout(std::time::Duration),

    #[error("acknowledge mismatch: expected ({exp_flow}, {exp_measurement}, {exp_stream}), got ({got_flow}, {got_measurement}, {got_stream})")]
    AckMismatch {
        exp_flow: u32,
        exp_measurement: u64,
        exp_stream: u16,
        got_flow: u32,
        got_measurement: u64,
        got_stream: u16,
    },

    #[error("acknowledge reported failure")]
    AckFailed,

    #[error("identify miss: no flow matched")]
    IdentifyMiss,

    #[error("association notification received, tearing down")]
    AssociationNotification,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn socket_setup(msg: impl Into<String>) -> Self {
        Self::SocketSetup(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True if this error is survivable by the caller's loop (spec.md §7:
    /// transient transport errors and would-block are not fatal).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
