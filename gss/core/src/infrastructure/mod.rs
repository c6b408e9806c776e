// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod cache;
pub mod context_cache;
pub mod helper;
pub mod init_cache;
pub mod keyring;
pub mod null_mech;
pub mod qword;
