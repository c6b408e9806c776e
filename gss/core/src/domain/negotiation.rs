// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server-side negotiation records and GSS status codes.

use serde::{Deserialize, Serialize};

use crate::domain::handle::RawHandle;

pub const GSS_S_COMPLETE: u32 = 0;
pub const GSS_S_NO_CONTEXT: u32 = 8 << 16;
pub const GSS_S_FAILURE: u32 = 13 << 16;

/// Identity of an accept-context negotiation: the peer's handle and token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitKey {
    pub in_handle: RawHandle,
    pub in_token: Vec<u8>,
}

impl InitKey {
    pub fn new(in_handle: RawHandle, in_token: Vec<u8>) -> Self {
        Self {
            in_handle,
            in_token,
        }
    }
}

/// Request context forwarded to the helper with a negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitMeta {
    pub lustre_svc: u32,
    /// Primary network id of the peer.
    pub nid: u64,
    pub nodemap: String,
}

/// What the helper produced for a negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResult {
    pub out_handle: RawHandle,
    pub out_token: Vec<u8>,
    pub major: u32,
    pub minor: u32,
}

/// Status pair sent back in an error-notify reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorNotify {
    pub major: u32,
    pub minor: u32,
}
