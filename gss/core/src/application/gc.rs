// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Context Garbage Collector - background sweep of both sides of the layer
//!
//! Each cycle drops expired entries from the server caches and collects
//! dead contexts of every registered client security domain.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Periodic reclamation of expired security contexts

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::client_manager::ClientContextManager;
use crate::domain::config::GcConfig;
use crate::infrastructure::context_cache::ContextCache;
use crate::infrastructure::init_cache::InitCache;

pub struct GarbageCollector {
    init_cache: Option<Arc<InitCache>>,
    ctx_cache: Option<Arc<ContextCache>>,
    managers: Mutex<Vec<Weak<ClientContextManager>>>,
    config: GcConfig,
    shutdown_token: CancellationToken,
}

impl GarbageCollector {
    pub fn new(config: GcConfig) -> Self {
        Self {
            init_cache: None,
            ctx_cache: None,
            managers: Mutex::new(Vec::new()),
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Also sweep the server caches.
    pub fn with_server_caches(mut self, init: Arc<InitCache>, contexts: Arc<ContextCache>) -> Self {
        self.init_cache = Some(init);
        self.ctx_cache = Some(contexts);
        self
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Adds a client domain. Dropped domains fall out on the next cycle.
    pub fn register(&self, manager: &Arc<ClientContextManager>) {
        self.managers.lock().push(Arc::downgrade(manager));
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        if !self.config.enabled {
            info!("Context garbage collector is disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval_secs,
            "Starting context garbage collector"
        );

        let mut tick = interval(Duration::from_secs(self.config.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let collected = self.sweep_cycle();
                    if collected > 0 {
                        info!(collected, "Context gc cycle completed");
                    } else {
                        debug!("Context gc cycle found nothing to collect");
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping context garbage collector");
                    break;
                }
            }
        }

        info!("Context garbage collector stopped");
    }

    /// Runs one collection pass and returns the number of entries and
    /// contexts reclaimed.
    pub fn sweep_cycle(&self) -> usize {
        let now = Utc::now();
        let mut collected = 0;

        if let Some(cache) = &self.init_cache {
            collected += cache.sweep(now);
        }
        if let Some(cache) = &self.ctx_cache {
            collected += cache.sweep(now);
        }

        let managers: Vec<Arc<ClientContextManager>> = {
            let mut registered = self.managers.lock();
            registered.retain(|weak| weak.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for manager in managers {
            collected += manager.gc_ctx();
            collected += manager.reap_released();
        }

        collected
    }
}
