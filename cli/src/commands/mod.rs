// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for LGSS CLI

pub mod config;
pub mod upcall;

pub use self::config::ConfigCommand;
pub use self::upcall::UpcallCommand;
