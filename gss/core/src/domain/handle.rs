// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Opaque context handles and the server-side handle index generator.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Handles issued by this layer are always 8 bytes (a little-endian index).
pub const MAX_HANDLE_SIZE: usize = 8;

/// Opaque byte string identifying a context on the wire.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawHandle(Vec<u8>);

impl RawHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_index(index: u64) -> Self {
        Self(index.to_le_bytes().to_vec())
    }

    /// Returns the index encoded in an 8-byte handle, or `None` for any other length.
    pub fn to_index(&self) -> Option<u64> {
        let bytes: [u8; MAX_HANDLE_SIZE] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for RawHandle {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_index() {
            Some(index) => write!(f, "{:#x}", index),
            None => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({})", self)
    }
}

/// Monotonic generator of context indexes, seeded randomly so restarted
/// servers do not hand out handles a peer may still hold.
#[derive(Debug)]
pub struct ContextIndex {
    next: AtomicU64,
}

impl ContextIndex {
    pub fn new() -> Self {
        Self::starting_at(rand::random::<u64>())
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ContextIndex {
    fn default() -> Self {
        Self::new()
    }
}
