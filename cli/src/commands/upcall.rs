// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Helper protocol tools
//!
//! Commands: decode-request, encode-downcall, check-reply

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::json;
use tracing::{debug, info};

use lgss_core::application::downcall::Downcall;
use lgss_core::domain::config::ServerConfig;
use lgss_core::domain::handle::RawHandle;
use lgss_core::domain::mechanism::MechanismRegistry;
use lgss_core::domain::sequence_window::GSS_SEQ_WIN;
use lgss_core::infrastructure::context_cache::ContextCache;
use lgss_core::infrastructure::init_cache::{InitReply, InitRequestLine};
use lgss_core::infrastructure::null_mech::NullMechanism;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReplyCache {
    Init,
    Context,
}

#[derive(Subcommand)]
pub enum UpcallCommand {
    /// Decode a negotiation request line sent to the server helper
    DecodeRequest {
        #[arg(value_name = "LINE")]
        line: String,
    },

    /// Build a client update payload, printed as hex
    EncodeDowncall {
        /// Sequence window of the established context
        #[arg(long, default_value_t = GSS_SEQ_WIN)]
        window: u32,

        /// Context handle (hex)
        #[arg(long)]
        handle: Option<String>,

        /// Exported mechanism context (hex)
        #[arg(long, default_value = "")]
        mech: String,

        /// Encode a failure with this rpc error
        #[arg(long)]
        rpc_err: Option<u32>,

        /// Encode a failure with this GSS major status
        #[arg(long)]
        gss_err: Option<u32>,
    },

    /// Check the syntax of a server helper reply line
    CheckReply {
        #[arg(long, value_enum)]
        cache: ReplyCache,

        #[arg(value_name = "LINE")]
        line: String,
    },
}

pub async fn handle_command(command: UpcallCommand) -> Result<()> {
    match command {
        UpcallCommand::DecodeRequest { line } => decode_request(&line),
        UpcallCommand::EncodeDowncall {
            window,
            handle,
            mech,
            rpc_err,
            gss_err,
        } => {
            let downcall = build_downcall(window, handle.as_deref(), &mech, rpc_err, gss_err)?;
            debug!(?downcall, "encoding downcall");
            println!("{}", hex::encode(downcall.encode()));
            Ok(())
        }
        UpcallCommand::CheckReply { cache, line } => check_reply(cache, &line),
    }
}

fn terminated(line: &str) -> String {
    if line.ends_with('\n') {
        line.to_string()
    } else {
        format!("{}\n", line)
    }
}

fn decode_request(line: &str) -> Result<()> {
    let req = InitRequestLine::decode(&terminated(line)).context("Failed to decode request line")?;
    debug!(index = req.index, nid = %format!("{:#x}", req.nid), "decoded request line");
    let decoded = json!({
        "lustre_svc": req.lustre_svc,
        "nid": format!("{:#x}", req.nid),
        "index": req.index,
        "nodemap": req.nodemap,
        "in_handle": req.in_handle.to_string(),
        "in_token": hex::encode(&req.in_token),
    });
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

fn build_downcall(
    window: u32,
    handle: Option<&str>,
    mech: &str,
    rpc_err: Option<u32>,
    gss_err: Option<u32>,
) -> Result<Downcall> {
    if rpc_err.is_some() || gss_err.is_some() {
        return Ok(Downcall::Failed {
            rpc_err: rpc_err.unwrap_or(0),
            gss_err: gss_err.unwrap_or(0),
        });
    }

    if window == 0 {
        anyhow::bail!("window must be non-zero for an established context");
    }
    let handle = handle.context("--handle is required unless encoding a failure")?;
    let handle = hex::decode(handle).context("--handle is not valid hex")?;
    let mech_token = hex::decode(mech).context("--mech is not valid hex")?;

    Ok(Downcall::Established {
        win: window,
        handle: RawHandle::new(handle),
        mech_token,
    })
}

fn check_reply(cache: ReplyCache, line: &str) -> Result<()> {
    let line = terminated(line);
    info!(?cache, "checking server helper reply");
    match cache {
        ReplyCache::Init => {
            let reply = InitReply::parse(&line).context("Invalid init reply")?;
            println!(
                "{}",
                format!(
                    "✓ init reply: out_handle {} major {:#x} minor {:#x} expires {}",
                    reply.result.out_handle, reply.result.major, reply.result.minor, reply.expiry
                )
                .green()
            );
        }
        ReplyCache::Context => {
            let registry = MechanismRegistry::new().with(Arc::new(NullMechanism));
            let scratch = ContextCache::new(Arc::new(registry), &ServerConfig::default());
            match scratch.import_reply(&line).context("Invalid context reply")? {
                Some(ctx) => println!(
                    "{}",
                    format!(
                        "✓ context reply: handle {} uid {} expires {}",
                        ctx.handle(),
                        ctx.uid(),
                        ctx.expiry()
                    )
                    .green()
                ),
                None => println!("{}", "✓ context reply: negative entry".green()),
            }
        }
    }
    Ok(())
}
