// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Payload of a client helper `update`.
//!
//! ```text
//! u32 window
//! window == 0: u32 rpc_error, u32 gss_error
//! window != 0: rawobj handle, rawobj mech_context
//! rawobj: u32 length, bytes, zero padding to a multiple of 4
//! ```
//!
//! All integers are little-endian.

use crate::domain::errors::GssError;
use crate::domain::handle::RawHandle;

/// errno a helper reports when the negotiation can simply be retried.
pub const ERESTART: u32 = 85;

/// True for an `rpc_err` of `ERESTART`, sent either as the errno or negated.
pub fn is_restart(rpc_err: u32) -> bool {
    (rpc_err as i32).unsigned_abs() == ERESTART
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downcall {
    Established {
        win: u32,
        handle: RawHandle,
        mech_token: Vec<u8>,
    },
    Failed {
        rpc_err: u32,
        gss_err: u32,
    },
}

impl Downcall {
    pub fn parse(data: &[u8]) -> Result<Self, GssError> {
        let mut cursor = Cursor { data };
        let win = cursor.u32("window")?;
        if win == 0 {
            return Ok(Downcall::Failed {
                rpc_err: cursor.u32("rpc error")?,
                gss_err: cursor.u32("gss error")?,
            });
        }

        let handle = RawHandle::new(cursor.rawobj("handle")?);
        let mech_token = cursor.rawobj("mech context")?;
        Ok(Downcall::Established {
            win,
            handle,
            mech_token,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Downcall::Established {
                win,
                handle,
                mech_token,
            } => {
                out.extend_from_slice(&win.to_le_bytes());
                put_rawobj(&mut out, handle.as_bytes());
                put_rawobj(&mut out, mech_token);
            }
            Downcall::Failed { rpc_err, gss_err } => {
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&rpc_err.to_le_bytes());
                out.extend_from_slice(&gss_err.to_le_bytes());
            }
        }
        out
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn put_rawobj(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
    out.resize(out.len() + padded(bytes.len()) - bytes.len(), 0);
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], GssError> {
        if self.data.len() < len {
            return Err(GssError::protocol(format!(
                "downcall truncated in {}: need {} bytes, have {}",
                field,
                len,
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn u32(&mut self, field: &str) -> Result<u32, GssError> {
        let bytes = self.take(4, field)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(arr))
    }

    fn rawobj(&mut self, field: &str) -> Result<Vec<u8>, GssError> {
        let len = self.u32(field)? as usize;
        let bytes = self.take(len, field)?.to_vec();
        // the final object may omit its padding
        let pad = (padded(len) - len).min(self.data.len());
        self.take(pad, field)?;
        Ok(bytes)
    }
}
