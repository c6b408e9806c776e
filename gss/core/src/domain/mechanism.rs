// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Security Mechanism Seam
//!
//! The context layer never performs cryptography itself. Every negotiated
//! context carries an opaque [`MechContext`] produced by a [`Mechanism`]
//! (Kerberos-like, shared-key, or the `null` mechanism in
//! [`crate::infrastructure::null_mech`]).
//!
//! The layer only needs three things from a mechanism context:
//!
//! - its expiry time, which bounds how long a cached context stays usable;
//! - an exported token, equality-comparable, used for display and tests;
//! - a reverse copy, used to build the server-to-client context that shares
//!   the keys of an established client-to-server context.
//!
//! Signing, sealing and token encoding belong to the RPC layer and are not
//! part of this trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MechError {
    #[error("malformed mechanism context: {0}")]
    Malformed(String),

    #[error("mechanism '{0}' is not registered")]
    Unsupported(String),

    #[error("mechanism context has no usable expiry")]
    NoExpiry,

    #[error("mechanism context cannot be reversed: {0}")]
    NotReversible(String),
}

/// Opaque, mechanism-specific security context.
pub trait MechContext: Send + Sync + fmt::Debug {
    /// Name of the mechanism that produced this context.
    fn mech_name(&self) -> &str;

    /// Absolute expiry of the underlying credentials.
    fn expiry(&self) -> Result<DateTime<Utc>, MechError>;

    /// Exported form of the context. Two contexts with equal exports are equivalent.
    fn export(&self) -> Vec<u8>;

    /// Builds the context used in the opposite direction over the same keys.
    fn copy_reverse(&self) -> Result<Box<dyn MechContext>, MechError>;

    /// One-line human readable description, shown by context listings.
    fn describe(&self) -> String {
        format!("{} ({} bytes)", self.mech_name(), self.export().len())
    }
}

/// Imports serialized contexts handed down by the privileged helper.
pub trait Mechanism: Send + Sync {
    fn name(&self) -> &str;

    fn import(&self, data: &[u8]) -> Result<Box<dyn MechContext>, MechError>;
}

/// Name-indexed set of available mechanisms.
#[derive(Clone, Default)]
pub struct MechanismRegistry {
    mechs: HashMap<String, Arc<dyn Mechanism>>,
}

impl MechanismRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, mech: Arc<dyn Mechanism>) -> Self {
        self.register(mech);
        self
    }

    pub fn register(&mut self, mech: Arc<dyn Mechanism>) {
        self.mechs.insert(mech.name().to_string(), mech);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Mechanism>, MechError> {
        self.mechs
            .get(name)
            .cloned()
            .ok_or_else(|| MechError::Unsupported(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mechs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field("mechs", &self.names())
            .finish()
    }
}
