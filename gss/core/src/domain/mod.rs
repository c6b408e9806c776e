// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model of the context layer: contexts, slots, handles, replay
//! windows and the mechanism seam.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types and invariants shared by the client and server sides

pub mod client_context;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod handle;
pub mod mechanism;
pub mod negotiation;
pub mod sequence_window;
pub mod slot;
pub mod svc_context;
