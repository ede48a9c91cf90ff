// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Failure taxonomy shared across the pipeline.

use nix::errno::Errno;
use remain::sorted;
use thiserror::Error;

use crate::nal::NalError;

/// Errors surfaced by decoder and pool operations.
///
/// `TimedOut` and `WouldBlock` are back-pressure signals handled internally
/// by rescheduling; they are never delivered to the client. Everything else
/// either fails the single operation (`Aborted`, delivered per-callback on
/// flush) or trips the decoder into its terminal error state.
#[sorted]
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("request aborted by flush")]
    Aborted,
    #[error("invalid argument: {0}")]
    BadValue(String),
    #[error("device failure or invariant violation: {0}")]
    Corrupted(#[from] anyhow::Error),
    #[error("malformed bitstream: {0}")]
    MalformedStream(&'static str),
    #[error("allocation failed")]
    NoMemory,
    #[error("decoder has not been started")]
    NotInitialized,
    #[error("timed out")]
    TimedOut,
    #[error("operation would block")]
    WouldBlock,
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

impl DecodeError {
    /// Back-pressure errors that are retried rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, DecodeError::TimedOut | DecodeError::WouldBlock)
    }
}

impl From<Errno> for DecodeError {
    fn from(errno: Errno) -> DecodeError {
        match errno {
            Errno::EAGAIN => DecodeError::WouldBlock,
            Errno::ETIMEDOUT => DecodeError::TimedOut,
            Errno::ENOMEM => DecodeError::NoMemory,
            Errno::EINVAL => DecodeError::BadValue("rejected by the kernel".to_string()),
            e => DecodeError::Corrupted(anyhow::anyhow!("kernel call failed: {}", e)),
        }
    }
}

impl From<NalError> for DecodeError {
    fn from(e: NalError) -> DecodeError {
        match e {
            NalError::InsufficientData => {
                DecodeError::MalformedStream("bitstream ended inside a syntax element")
            }
            NalError::MalformedStream(what) => DecodeError::MalformedStream(what),
        }
    }
}
