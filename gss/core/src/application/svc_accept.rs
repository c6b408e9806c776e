// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # GSS Server
//!
//! Accept path for incoming secure RPCs. Negotiation requests go through
//! the init cache to the server helper; data and destroy requests are
//! resolved against the context cache by handle.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Owns the server-side caches and turns RPC security
//!   headers into accept decisions

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::client_manager::{ClientContextManager, ServerLink};
use crate::domain::config::ServerConfig;
use crate::domain::errors::GssError;
use crate::domain::handle::{ContextIndex, RawHandle, MAX_HANDLE_SIZE};
use crate::domain::mechanism::MechanismRegistry;
use crate::domain::negotiation::{ErrorNotify, InitKey, InitMeta, GSS_S_NO_CONTEXT};
use crate::domain::sequence_window::GSS_SEQ_WIN;
use crate::infrastructure::cache::CacheStatus;
use crate::infrastructure::context_cache::{ContextCache, SvcContextRef};
use crate::infrastructure::helper::SvcHelperBridge;
use crate::infrastructure::init_cache::InitCache;

pub const SECSVC_OK: u32 = 0;
pub const SECSVC_COMPLETE: u32 = 1;
pub const SECSVC_DROP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GssProc {
    Init,
    ContinueInit,
    Data,
    Destroy,
}

/// Security header of an incoming RPC.
#[derive(Debug, Clone)]
pub struct GssRequest {
    pub procedure: GssProc,
    pub handle: RawHandle,
    pub seq: u32,
    pub token: Vec<u8>,
    pub lustre_svc: u32,
    pub peer_nid: u64,
    pub nodemap: String,
    /// Handle the peer wants us to use when calling back.
    pub reverse_handle: RawHandle,
    /// Local target the RPC was addressed to.
    pub target: String,
}

impl GssRequest {
    pub fn init(token: Vec<u8>, peer_nid: u64, target: impl Into<String>) -> Self {
        Self {
            procedure: GssProc::Init,
            handle: RawHandle::empty(),
            seq: 0,
            token,
            lustre_svc: 0,
            peer_nid,
            nodemap: String::new(),
            reverse_handle: RawHandle::empty(),
            target: target.into(),
        }
    }

    pub fn data(handle: RawHandle, seq: u32, peer_nid: u64) -> Self {
        Self {
            procedure: GssProc::Data,
            handle,
            seq,
            token: Vec::new(),
            lustre_svc: 0,
            peer_nid,
            nodemap: String::new(),
            reverse_handle: RawHandle::empty(),
            target: String::new(),
        }
    }
}

/// Reply fields of a completed negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitResponse {
    pub major: u32,
    pub minor: u32,
    pub seq_win: u32,
    pub handle: RawHandle,
    pub token: Vec<u8>,
}

#[derive(Debug)]
pub enum Accepted {
    Init(InitResponse),
    Data(SvcContextRef),
    Destroyed,
}

#[derive(Debug)]
pub enum AcceptOutcome {
    Ok(Accepted),
    /// Answer with an error notification instead of a normal reply.
    Complete(ErrorNotify),
    /// Send nothing; the peer will resend.
    Drop,
}

impl AcceptOutcome {
    pub fn code(&self) -> u32 {
        match self {
            AcceptOutcome::Ok(_) => SECSVC_OK,
            AcceptOutcome::Complete(_) => SECSVC_COMPLETE,
            AcceptOutcome::Drop => SECSVC_DROP,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AcceptOutcome::Ok(_) => "ok",
            AcceptOutcome::Complete(_) => "complete",
            AcceptOutcome::Drop => "drop",
        }
    }
}

pub struct GssServer {
    init_cache: Arc<InitCache>,
    ctx_cache: Arc<ContextCache>,
    index: Arc<ContextIndex>,
    config: ServerConfig,
}

impl GssServer {
    pub fn new(registry: Arc<MechanismRegistry>, config: ServerConfig) -> Self {
        Self::with_index(registry, Arc::new(ContextIndex::new()), config)
    }

    pub fn with_index(
        registry: Arc<MechanismRegistry>,
        index: Arc<ContextIndex>,
        config: ServerConfig,
    ) -> Self {
        Self {
            init_cache: Arc::new(InitCache::new(index.clone(), &config)),
            ctx_cache: Arc::new(ContextCache::new(registry, &config)),
            index,
            config,
        }
    }

    pub fn init_cache(&self) -> &Arc<InitCache> {
        &self.init_cache
    }

    pub fn context_cache(&self) -> &Arc<ContextCache> {
        &self.ctx_cache
    }

    /// Link for client domains that install reverse entries into this server.
    pub fn server_link(&self) -> ServerLink {
        ServerLink {
            contexts: self.ctx_cache.clone(),
            index: self.index.clone(),
        }
    }

    /// Waits briefly for the helper to attach its channel.
    pub async fn start(&self) -> bool {
        self.init_cache
            .await_listener(
                self.config.helper_wait_attempts,
                self.config.helper_wait_interval(),
            )
            .await
    }

    /// Spawns the configured server helper and bridges both caches to it.
    pub fn start_helper(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>, GssError> {
        SvcHelperBridge::spawn(
            &self.config.helper_path,
            Vec::new(),
            self.init_cache.clone(),
            self.ctx_cache.clone(),
            shutdown,
        )
    }

    pub fn shutdown(&self) {
        self.init_cache.close_channel();
        let init = self.init_cache.purge();
        let contexts = self.ctx_cache.purge();
        info!(init, contexts, "gss server caches purged");
    }

    pub async fn accept(&self, req: &GssRequest) -> AcceptOutcome {
        let outcome = match req.procedure {
            GssProc::Init | GssProc::ContinueInit => self.handle_init(req).await,
            GssProc::Data => self.handle_data(req),
            GssProc::Destroy => self.handle_destroy(req),
        };
        metrics::counter!("lgss_accept_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn handle_init(&self, req: &GssRequest) -> AcceptOutcome {
        let key = InitKey::new(req.handle.clone(), req.token.clone());
        let meta = InitMeta {
            lustre_svc: req.lustre_svc,
            nid: req.peer_nid,
            nodemap: req.nodemap.clone(),
        };
        let entry = self.init_cache.request(key, meta);

        let status = match self.init_cache.check(&entry) {
            CacheStatus::Pending => {
                let timeout = self.config.upcall_timeout();
                self.init_cache.wait(&entry, timeout).await;
                self.init_cache.check(&entry)
            }
            status => status,
        };

        match status {
            CacheStatus::Ready => {}
            CacheStatus::Pending => {
                warn!(
                    peer = %format!("{:#x}", req.peer_nid),
                    "waited {}s timeout, drop",
                    self.config.upcall_timeout_secs
                );
                return AcceptOutcome::Drop;
            }
            CacheStatus::Negative | CacheStatus::Unavailable => {
                debug!(peer = %format!("{:#x}", req.peer_nid), ?status, "negotiation unavailable, drop");
                return AcceptOutcome::Drop;
            }
        }

        let Some(result) = entry.value().cloned() else {
            return AcceptOutcome::Drop;
        };

        let Some(ctx) = self.ctx_cache.lookup_by_handle(&result.out_handle) else {
            warn!(
                major = %format!("{:#x}", result.major),
                minor = %format!("{:#x}", result.minor),
                "authentication failed"
            );
            return AcceptOutcome::Complete(ErrorNotify {
                major: result.major,
                minor: result.minor,
            });
        };

        ctx.set_reverse_handle(req.reverse_handle.clone());
        ctx.set_target(req.target.clone());

        if result.out_handle.len() > MAX_HANDLE_SIZE {
            error!(
                len = result.out_handle.len(),
                max = MAX_HANDLE_SIZE,
                "context handle too large"
            );
            self.ctx_cache.destroy(&ctx);
            return AcceptOutcome::Drop;
        }

        debug!(
            handle = %result.out_handle,
            uid = ctx.uid(),
            target = %req.target,
            "negotiation accepted"
        );
        AcceptOutcome::Ok(Accepted::Init(InitResponse {
            major: result.major,
            minor: result.minor,
            seq_win: GSS_SEQ_WIN,
            handle: result.out_handle,
            token: result.out_token,
        }))
    }

    fn handle_data(&self, req: &GssRequest) -> AcceptOutcome {
        match self.checked_ctx(req) {
            Ok(ctx) => AcceptOutcome::Ok(Accepted::Data(ctx)),
            Err(outcome) => outcome,
        }
    }

    fn handle_destroy(&self, req: &GssRequest) -> AcceptOutcome {
        match self.checked_ctx(req) {
            Ok(ctx) => {
                self.destroy_ctx(&ctx);
                AcceptOutcome::Ok(Accepted::Destroyed)
            }
            Err(outcome) => outcome,
        }
    }

    fn checked_ctx(&self, req: &GssRequest) -> Result<SvcContextRef, AcceptOutcome> {
        let Some(ctx) = self.get_ctx_by_handle(&req.handle, req.peer_nid) else {
            return Err(AcceptOutcome::Complete(ErrorNotify {
                major: GSS_S_NO_CONTEXT,
                minor: 0,
            }));
        };
        if let Err(e) = ctx.check_sequence(req.seq) {
            warn!(handle = %req.handle, "{}", e);
            metrics::counter!("lgss_replay_rejected_total").increment(1);
            return Err(AcceptOutcome::Drop);
        }
        Ok(ctx)
    }

    pub fn get_ctx_by_handle(&self, handle: &RawHandle, peer_nid: u64) -> Option<SvcContextRef> {
        let found = self.ctx_cache.lookup_by_handle(handle);
        if found.is_none() {
            warn!(
                peer = %format!("{:#x}", peer_nid),
                "Invalid gss ctx idx {:#x}",
                handle.to_index().unwrap_or(0)
            );
        }
        found
    }

    pub fn put_ctx(&self, ctx: SvcContextRef) {
        drop(ctx);
    }

    pub fn destroy_ctx(&self, ctx: &SvcContextRef) {
        self.ctx_cache.destroy(ctx);
    }

    /// Copies a server entry into `client`'s domain as its reverse root context.
    pub fn install_reverse_ctx(
        &self,
        client: &ClientContextManager,
        ctx: &SvcContextRef,
    ) -> Result<(), GssError> {
        client.install_reverse_ctx(ctx)
    }

    pub fn update_sequence(&self, handle: &RawHandle, seq: u32) -> bool {
        self.ctx_cache.update_sequence(handle, seq)
    }

    pub fn expire_reverse_ctx(&self, handle: &RawHandle) -> bool {
        self.ctx_cache.expire_reverse(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::negotiation::{InitResult, GSS_S_FAILURE};
    use crate::domain::svc_context::RoleFlags;
    use crate::infrastructure::context_cache::{ContextIdentity, ContextInstall};
    use crate::infrastructure::init_cache::InitRequestLine;
    use crate::infrastructure::null_mech::{NullMechanism, NullToken};
    use chrono::Utc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn server() -> Arc<GssServer> {
        let registry = MechanismRegistry::new().with(Arc::new(NullMechanism));
        Arc::new(GssServer::with_index(
            Arc::new(registry),
            Arc::new(ContextIndex::starting_at(7)),
            ServerConfig::default(),
        ))
    }

    /// Answers every request; installs a context only when `accept` is set.
    fn fake_helper(server: Arc<GssServer>, mut rx: UnboundedReceiver<String>, accept: bool) {
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let req = InitRequestLine::decode(&line).unwrap();
                let handle = RawHandle::from_index(req.index);
                let expiry = Utc::now() + chrono::Duration::hours(1);
                if accept {
                    server.context_cache().install(ContextInstall {
                        handle: handle.clone(),
                        expiry,
                        role: RoleFlags::default(),
                        mapped_uid: 0,
                        identity: Some(ContextIdentity {
                            uid: 1000,
                            gid: 1000,
                            mech: NullToken::new(expiry, b"k".to_vec()).into_context(),
                        }),
                    });
                }
                let major = if accept { 0 } else { GSS_S_FAILURE };
                server
                    .init_cache()
                    .populate(
                        InitKey::new(req.in_handle, req.in_token),
                        InitResult {
                            out_handle: handle,
                            out_token: b"reply".to_vec(),
                            major,
                            minor: 3,
                        },
                        expiry,
                    )
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_init_accepted() {
        let server = server();
        fake_helper(server.clone(), server.init_cache().open_channel(), true);

        let mut req = GssRequest::init(b"tok".to_vec(), 0x10, "fsX-MDT0000");
        req.reverse_handle = RawHandle::from_index(0x99);
        let outcome = server.accept(&req).await;
        assert_eq!(outcome.code(), SECSVC_OK);

        let AcceptOutcome::Ok(Accepted::Init(reply)) = outcome else {
            panic!("expected init reply");
        };
        assert_eq!(reply.handle, RawHandle::from_index(7));
        assert_eq!(reply.seq_win, GSS_SEQ_WIN);
        assert_eq!(reply.token, b"reply".to_vec());

        let ctx = server.get_ctx_by_handle(&reply.handle, 0x10).unwrap();
        assert_eq!(ctx.reverse_handle(), RawHandle::from_index(0x99));
        assert_eq!(ctx.target().as_deref(), Some("fsX-MDT0000"));
    }

    #[tokio::test]
    async fn test_init_failure_notifies_peer() {
        let server = server();
        fake_helper(server.clone(), server.init_cache().open_channel(), false);

        let outcome = server
            .accept(&GssRequest::init(b"bad".to_vec(), 0x10, "t"))
            .await;
        assert_eq!(outcome.code(), SECSVC_COMPLETE);
        let AcceptOutcome::Complete(notify) = outcome else {
            panic!("expected error notify");
        };
        assert_eq!(notify.major, GSS_S_FAILURE);
        assert_eq!(notify.minor, 3);
    }

    #[tokio::test]
    async fn test_init_without_helper_is_dropped() {
        let server = server();
        let outcome = server
            .accept(&GssRequest::init(b"tok".to_vec(), 0x10, "t"))
            .await;
        assert_eq!(outcome.code(), SECSVC_DROP);
    }

    #[tokio::test]
    async fn test_data_unknown_handle_and_replay() {
        let server = server();
        let outcome = server.accept(&GssRequest::data(RawHandle::from_index(1), 1, 0x10)).await;
        let AcceptOutcome::Complete(notify) = outcome else {
            panic!("expected error notify");
        };
        assert_eq!(notify.major, GSS_S_NO_CONTEXT);

        fake_helper(server.clone(), server.init_cache().open_channel(), true);
        let AcceptOutcome::Ok(Accepted::Init(reply)) = server
            .accept(&GssRequest::init(b"tok".to_vec(), 0x10, "t"))
            .await
        else {
            panic!("expected init reply");
        };

        let data = GssRequest::data(reply.handle.clone(), 5, 0x10);
        assert!(matches!(
            server.accept(&data).await,
            AcceptOutcome::Ok(Accepted::Data(_))
        ));
        assert_eq!(server.accept(&data).await.code(), SECSVC_DROP);
    }

    #[tokio::test]
    async fn test_destroy_removes_context() {
        let server = server();
        fake_helper(server.clone(), server.init_cache().open_channel(), true);
        let AcceptOutcome::Ok(Accepted::Init(reply)) = server
            .accept(&GssRequest::init(b"tok".to_vec(), 0x10, "t"))
            .await
        else {
            panic!("expected init reply");
        };

        let mut destroy = GssRequest::data(reply.handle.clone(), 1, 0x10);
        destroy.procedure = GssProc::Destroy;
        assert!(matches!(
            server.accept(&destroy).await,
            AcceptOutcome::Ok(Accepted::Destroyed)
        ));
        assert!(server.get_ctx_by_handle(&reply.handle, 0x10).is_none());
        assert_eq!(server.context_cache().sweep(Utc::now()), 1);
    }

    #[tokio::test]
    async fn test_shutdown_purges_caches() {
        let server = server();
        let expiry = Utc::now() + chrono::Duration::hours(1);
        server.context_cache().install(ContextInstall {
            handle: RawHandle::from_index(3),
            expiry,
            role: RoleFlags::default(),
            mapped_uid: 0,
            identity: None,
        });
        server.shutdown();
        assert!(server.context_cache().is_empty());
        assert!(server.init_cache().is_empty());
    }
}
