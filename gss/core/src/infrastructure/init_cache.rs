// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server cache of in-flight accept-context negotiations.
//!
//! Entries are keyed by the peer's (input handle, input token). The first
//! RPC carrying a key sends one request line to the helper; identical
//! requests arriving meanwhile find the same pending entry and wait on it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::config::ServerConfig;
use crate::domain::errors::GssError;
use crate::domain::handle::{ContextIndex, RawHandle};
use crate::domain::negotiation::{InitKey, InitMeta, InitResult};
use crate::infrastructure::cache::{CacheDetail, CacheHead, CacheStatus, UpcallCache};
use crate::infrastructure::qword::{u32_from_le, u64_from_le, QwordReader, QwordWriter};

pub struct InitDetail {
    index: Arc<ContextIndex>,
}

impl CacheDetail for InitDetail {
    type Key = InitKey;
    type Meta = InitMeta;
    type Value = InitResult;

    fn name(&self) -> &'static str {
        "init"
    }

    fn encode_request(&self, key: &InitKey, meta: &InitMeta) -> Option<String> {
        // A peer without a handle yet gets a fresh server index suggested.
        let index = if key.in_handle.is_empty() {
            self.index.next()
        } else {
            0
        };
        let mut nodemap = meta.nodemap.as_bytes().to_vec();
        nodemap.push(0);

        let mut writer = QwordWriter::new();
        writer
            .add_hex(&meta.lustre_svc.to_le_bytes())
            .add_hex(&meta.nid.to_le_bytes())
            .add_hex(&index.to_le_bytes())
            .add_hex(&nodemap)
            .add_hex(key.in_handle.as_bytes())
            .add_hex(&key.in_token);
        Some(writer.finish())
    }
}

pub type InitEntry = Arc<CacheHead<InitDetail>>;

/// Decoded form of a negotiation request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequestLine {
    pub lustre_svc: u32,
    pub nid: u64,
    pub index: u64,
    pub nodemap: String,
    pub in_handle: RawHandle,
    pub in_token: Vec<u8>,
}

impl InitRequestLine {
    pub fn decode(line: &str) -> Result<Self, GssError> {
        let mut reader = QwordReader::new(line);
        let lustre_svc = u32_from_le(&reader.word("lustre_svc")?)?;
        let nid = u64_from_le(&reader.word("nid")?)?;
        let index = u64_from_le(&reader.word("index")?)?;
        let mut nodemap = reader.word("nodemap")?;
        if nodemap.last() == Some(&0) {
            nodemap.pop();
        }
        let nodemap = String::from_utf8(nodemap)
            .map_err(|_| GssError::protocol("nodemap is not valid utf-8"))?;
        let in_handle = RawHandle::new(reader.word("in_handle")?);
        let in_token = reader.word("in_token")?;

        Ok(Self {
            lustre_svc,
            nid,
            index,
            nodemap,
            in_handle,
            in_token,
        })
    }
}

/// Parsed helper answer for one negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReply {
    pub key: InitKey,
    pub expiry: DateTime<Utc>,
    pub result: InitResult,
}

impl InitReply {
    /// `in_handle in_token expiry major minor out_handle out_token`
    pub fn parse(line: &str) -> Result<Self, GssError> {
        let mut reader = QwordReader::new(line);
        let in_handle = RawHandle::new(reader.word("in_handle")?);
        let in_token = reader.word("in_token")?;
        let expiry = reader.expiry()?;
        let major = reader.expect_int("major")? as u32;
        let minor = reader.expect_int("minor")? as u32;
        let out_handle = RawHandle::new(reader.word("out_handle")?);
        let out_token = reader.word("out_token")?;

        Ok(Self {
            key: InitKey::new(in_handle, in_token),
            expiry,
            result: InitResult {
                out_handle,
                out_token,
                major,
                minor,
            },
        })
    }

    pub fn encode(&self) -> String {
        let mut writer = QwordWriter::new();
        writer
            .add_hex(self.key.in_handle.as_bytes())
            .add_hex(&self.key.in_token)
            .add_int(self.expiry.timestamp())
            .add_int(self.result.major as i64)
            .add_int(self.result.minor as i64)
            .add_hex(self.result.out_handle.as_bytes())
            .add_hex(&self.result.out_token);
        writer.finish()
    }
}

pub struct InitCache {
    cache: UpcallCache<InitDetail>,
}

impl InitCache {
    pub fn new(index: Arc<ContextIndex>, config: &ServerConfig) -> Self {
        Self {
            cache: UpcallCache::new(InitDetail { index }, config.new_entry_ttl()),
        }
    }

    /// Finds or creates the entry for a negotiation.
    pub fn request(&self, key: InitKey, meta: InitMeta) -> InitEntry {
        self.cache.lookup(key, meta)
    }

    pub fn check(&self, entry: &InitEntry) -> CacheStatus {
        self.cache.check(entry)
    }

    pub async fn wait(&self, entry: &InitEntry, timeout: Duration) -> bool {
        self.cache.wait(entry, timeout).await
    }

    /// Completes a pending negotiation and wakes everyone waiting on it.
    pub fn populate(
        &self,
        key: InitKey,
        result: InitResult,
        expiry: DateTime<Utc>,
    ) -> Result<InitEntry, GssError> {
        let out_handle = result.out_handle.clone();
        let major = result.major;
        let Some(entry) = self.cache.fill_pending(&key, Some(result), expiry) else {
            warn!(in_handle = %key.in_handle, "negotiation reply without pending request");
            return Err(GssError::InvalidUpdate);
        };
        debug!(
            in_handle = %key.in_handle,
            out_handle = %out_handle,
            major,
            "negotiation populated"
        );
        Ok(entry)
    }

    /// Parses and applies one reply line from the helper.
    pub fn parse_reply(&self, line: &str) -> Result<InitEntry, GssError> {
        let reply = InitReply::parse(line)?;
        self.populate(reply.key, reply.result, reply.expiry)
    }

    pub fn open_channel(&self) -> mpsc::UnboundedReceiver<String> {
        self.cache.channel().open()
    }

    pub fn close_channel(&self) {
        self.cache.channel().close()
    }

    pub fn has_listener(&self) -> bool {
        self.cache.channel().has_listener()
    }

    /// Gives the helper a chance to attach before the first negotiation.
    pub async fn await_listener(&self, attempts: u32, interval: Duration) -> bool {
        for _ in 0..attempts {
            if self.has_listener() {
                return true;
            }
            tokio::time::sleep(interval).await;
        }
        if self.has_listener() {
            return true;
        }
        info!("init upcall channel has no listener yet, negotiations will be dropped until the helper starts");
        false
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.cache.sweep(now)
    }

    pub fn purge(&self) -> usize {
        self.cache.purge()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
