// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-backed helpers.
//!
//! [`CommandUpcall`] starts one client helper per slot and turns its stdout
//! into store deliveries. [`SvcHelperBridge`] keeps one long-running server
//! helper attached to the init cache: request lines go to its stdin, reply
//! lines come back on its stdout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::config::ClientConfig;
use crate::domain::errors::GssError;
use crate::domain::slot::{Delivery, KeyUpcall, SecureSlotStore, UpcallLauncher};
use crate::infrastructure::context_cache::ContextCache;
use crate::infrastructure::init_cache::InitCache;

/// One line of client helper output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperDirective {
    Instantiate,
    Update(Vec<u8>),
    Revoke,
}

impl HelperDirective {
    pub fn parse(line: &str) -> Result<Self, GssError> {
        let line = line.trim();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, Some(arg.trim())),
            None => (line, None),
        };
        match (verb, arg) {
            ("instantiate", None) => Ok(Self::Instantiate),
            ("revoke", None) => Ok(Self::Revoke),
            ("update", Some(payload)) => hex::decode(payload)
                .map(Self::Update)
                .map_err(|e| GssError::protocol(format!("bad update payload: {}", e))),
            _ => Err(GssError::protocol(format!("unknown helper directive '{}'", line))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    interval: Duration,
    max_retries: u32,
}

/// Launches the client helper program as `<program> [args] <serial> <descriptor> <callout>`.
pub struct CommandUpcall {
    program: PathBuf,
    args: Vec<String>,
    store: OnceLock<Weak<dyn SecureSlotStore>>,
    retry: RetryPolicy,
}

impl CommandUpcall {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            store: OnceLock::new(),
            retry: RetryPolicy {
                interval: Duration::from_millis(50),
                max_retries: 20,
            },
        }
    }

    /// Launcher for the helper configured for a client security domain.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.helper_path)
            .with_args(config.helper_args.iter().cloned())
            .with_retry(config.helper_retry_interval(), config.helper_max_retries)
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, interval: Duration, max_retries: u32) -> Self {
        self.retry = RetryPolicy {
            interval,
            max_retries,
        };
        self
    }

    /// Connects the launcher to the store its helpers deliver to.
    pub fn attach(&self, store: Weak<dyn SecureSlotStore>) -> bool {
        self.store.set(store).is_ok()
    }
}

impl UpcallLauncher for CommandUpcall {
    fn launch(&self, upcall: KeyUpcall) -> Result<(), GssError> {
        let runtime = Handle::try_current()
            .map_err(|_| GssError::UpcallFailure("no runtime to run the helper on".to_string()))?;
        let store = self
            .store
            .get()
            .cloned()
            .ok_or_else(|| GssError::UpcallFailure("helper launcher not attached".to_string()))?;

        let _guard = runtime.enter();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(upcall.serial.to_string())
            .arg(&upcall.description)
            .arg(&upcall.callout)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GssError::UpcallFailure(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GssError::UpcallFailure("helper stdout not captured".to_string()))?;

        debug!(serial = upcall.serial, program = %self.program.display(), "client helper started");
        runtime.spawn(drive_client_helper(
            child,
            stdout,
            store,
            upcall.serial,
            self.retry,
        ));
        Ok(())
    }
}

async fn drive_client_helper(
    mut child: Child,
    stdout: ChildStdout,
    store: Weak<dyn SecureSlotStore>,
    serial: u32,
    retry: RetryPolicy,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(serial, "failed to read helper output: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let directive = match HelperDirective::parse(&line) {
            Ok(directive) => directive,
            Err(e) => {
                error!(serial, "{}", e);
                continue;
            }
        };
        let Some(store) = store.upgrade() else {
            debug!(serial, "slot store gone, abandoning helper");
            break;
        };
        if let Err(e) = apply_directive(store.as_ref(), serial, directive, retry).await {
            warn!(serial, "helper delivery failed: {}", e);
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => debug!(serial, "client helper finished"),
        Ok(status) => warn!(serial, %status, "client helper exited with failure"),
        Err(e) => warn!(serial, "failed to reap client helper: {}", e),
    }
}

async fn apply_directive(
    store: &dyn SecureSlotStore,
    serial: u32,
    directive: HelperDirective,
    retry: RetryPolicy,
) -> Result<(), GssError> {
    match directive {
        HelperDirective::Instantiate => store.deliver(serial, Delivery::Instantiate(&[])),
        HelperDirective::Update(data) => {
            let mut attempts = 0;
            loop {
                match store.deliver(serial, Delivery::Update(&data)) {
                    Err(GssError::TryAgain) if attempts < retry.max_retries => {
                        attempts += 1;
                        tokio::time::sleep(retry.interval).await;
                    }
                    other => return other,
                }
            }
        }
        HelperDirective::Revoke => {
            let slot = store
                .slot(serial)
                .ok_or_else(|| GssError::NotFound(format!("slot {}", serial)))?;
            store.revoke(&slot);
            Ok(())
        }
    }
}

/// Routes one prefixed reply line from the server helper to its cache.
pub fn dispatch_reply(init: &InitCache, contexts: &ContextCache, line: &str) -> Result<(), GssError> {
    if let Some(rest) = line.strip_prefix("init ") {
        init.parse_reply(rest).map(|_| ())
    } else if let Some(rest) = line.strip_prefix("context ") {
        contexts.import_reply(rest).map(|_| ())
    } else {
        Err(GssError::protocol(format!(
            "unknown server helper reply '{}'",
            line.split(' ').next().unwrap_or_default()
        )))
    }
}

pub struct SvcHelperBridge;

impl SvcHelperBridge {
    /// Starts the server helper and pumps both directions until it exits or
    /// `shutdown` fires. The init channel is closed when the bridge stops.
    pub fn spawn(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        init: Arc<InitCache>,
        contexts: Arc<ContextCache>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, GssError> {
        let program = program.into();
        let runtime = Handle::try_current()
            .map_err(|_| GssError::UpcallFailure("no runtime to run the helper on".to_string()))?;
        let _guard = runtime.enter();

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GssError::UpcallFailure(format!("failed to spawn {}: {}", program.display(), e))
            })?;
        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(GssError::UpcallFailure(
                "server helper pipes not captured".to_string(),
            ));
        };
        let mut requests = init.open_channel();
        info!(program = %program.display(), "server helper started");

        Ok(runtime.spawn(async move {
            let mut replies = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("server helper bridge shutting down");
                        break;
                    }
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        if let Err(e) = stdin.write_all(request.as_bytes()).await {
                            warn!("failed to write to server helper: {}", e);
                            break;
                        }
                    }
                    reply = replies.next_line() => match reply {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            if let Err(e) = dispatch_reply(&init, &contexts, &line) {
                                error!("server helper reply rejected: {}", e);
                            }
                        }
                        Ok(None) => {
                            warn!("server helper closed its output");
                            break;
                        }
                        Err(e) => {
                            warn!("failed to read server helper output: {}", e);
                            break;
                        }
                    }
                }
            }

            init.close_channel();
            if let Err(e) = child.kill().await {
                debug!("server helper already gone: {}", e);
            }
        }))
    }
}
