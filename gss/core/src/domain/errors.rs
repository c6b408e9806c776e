// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy shared by the client and server sides of the context layer.

use std::time::Duration;

use crate::domain::mechanism::MechError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GssError {
    #[error("out of memory while building security context")]
    NoMemory,

    #[error("upcall did not complete within {0:?}")]
    UpcallTimeout(Duration),

    #[error("malformed upcall data: {0}")]
    UpcallProtocol(String),

    #[error("upcall failed: {0}")]
    UpcallFailure(String),

    /// The helper gave up but the negotiation may be retried.
    #[error("negotiation interrupted, restart")]
    Restart,

    #[error("authentication failed: major {major:#x}, minor {minor:#x}")]
    AuthenticationFailure { major: u32, minor: u32 },

    #[error("sequence number {seq} rejected as replay")]
    ReplayRejected { seq: u32 },

    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    #[error("update for an entry that is not pending")]
    InvalidUpdate,

    /// The slot has no context bound yet; the helper should retry shortly.
    #[error("context not bound yet, try again")]
    TryAgain,

    #[error("slot {0} has been revoked")]
    Revoked(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no security context available")]
    NoContext,

    #[error(transparent)]
    Mechanism(#[from] MechError),
}

impl GssError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        GssError::UpcallProtocol(msg.into())
    }
}
