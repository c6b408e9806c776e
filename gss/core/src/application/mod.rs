// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application services: the client context manager, the server accept
//! path and the background collector.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer

pub mod binding;
pub mod client_manager;
pub mod downcall;
pub mod gc;
pub mod keyring_type;
pub mod svc_accept;
