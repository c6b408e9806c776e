// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # LGSS Core
//!
//! Secure RPC context establishment and caching.
//!
//! - Client side: [`application::client_manager::ClientContextManager`], one
//!   per security domain, keeps negotiated contexts in capability slots and
//!   delegates handshakes to a privileged helper.
//! - Server side: [`infrastructure::init_cache::InitCache`] and
//!   [`infrastructure::context_cache::ContextCache`] hold pending
//!   negotiations and established contexts; [`application::svc_accept::GssServer`]
//!   drives them for incoming RPCs.
//! - [`application::gc::GarbageCollector`] sweeps both sides periodically.
//!
//! # Architecture
//!
//! - **Layer:** Core System

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
