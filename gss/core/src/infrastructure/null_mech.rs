// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The `null` mechanism: contexts carry an expiry and an opaque key but
//! provide no protection. Used by deployments that run the framework without
//! Kerberos, and throughout the tests.
//!
//! Exported token layout: `u8 version (1) | u8 flags | i64 LE expiry | key`.

use chrono::{DateTime, TimeZone, Utc};

use crate::domain::mechanism::{MechContext, MechError, Mechanism};

const TOKEN_VERSION: u8 = 1;
const FLAG_REVERSE: u8 = 0x1;
const HEADER_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullToken {
    pub expiry: DateTime<Utc>,
    pub key: Vec<u8>,
    pub reverse: bool,
}

impl NullToken {
    pub fn new(expiry: DateTime<Utc>, key: Vec<u8>) -> Self {
        Self {
            expiry,
            key,
            reverse: false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.key.len());
        out.push(TOKEN_VERSION);
        out.push(if self.reverse { FLAG_REVERSE } else { 0 });
        out.extend_from_slice(&self.expiry.timestamp().to_le_bytes());
        out.extend_from_slice(&self.key);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, MechError> {
        if data.len() < HEADER_LEN {
            return Err(MechError::Malformed(format!(
                "token is {} bytes, need at least {}",
                data.len(),
                HEADER_LEN
            )));
        }
        if data[0] != TOKEN_VERSION {
            return Err(MechError::Malformed(format!("unknown version {}", data[0])));
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&data[2..HEADER_LEN]);
        let expiry = Utc
            .timestamp_opt(i64::from_le_bytes(secs), 0)
            .single()
            .ok_or(MechError::NoExpiry)?;

        Ok(Self {
            expiry,
            key: data[HEADER_LEN..].to_vec(),
            reverse: data[1] & FLAG_REVERSE != 0,
        })
    }

    pub fn into_context(self) -> Box<dyn MechContext> {
        Box::new(NullContext { token: self })
    }
}

#[derive(Debug, Clone)]
pub struct NullContext {
    token: NullToken,
}

impl MechContext for NullContext {
    fn mech_name(&self) -> &str {
        "null"
    }

    fn expiry(&self) -> Result<DateTime<Utc>, MechError> {
        Ok(self.token.expiry)
    }

    fn export(&self) -> Vec<u8> {
        self.token.encode()
    }

    fn copy_reverse(&self) -> Result<Box<dyn MechContext>, MechError> {
        let mut token = self.token.clone();
        token.reverse = !token.reverse;
        Ok(token.into_context())
    }

    fn describe(&self) -> String {
        format!(
            "null{} expires {}",
            if self.token.reverse { " (reverse)" } else { "" },
            self.token.expiry.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullMechanism;

impl Mechanism for NullMechanism {
    fn name(&self) -> &str {
        "null"
    }

    fn import(&self, data: &[u8]) -> Result<Box<dyn MechContext>, MechError> {
        Ok(NullToken::decode(data)?.into_context())
    }
}
