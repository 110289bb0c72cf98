use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::config::PreseedConfig;
use crate::dataset::StoragePath;
use crate::error::{Error, ErrorKind, Result};
use crate::exec::RunCtx;
use crate::fsops;
use crate::marker::{
    BOOKKEEPING_PREFIX, CompletionMarker, PreseedState, STAGING_PREFIX, atomic_write_text,
};
use crate::notify::{NotificationSink, PreseedEvent};
use crate::replication::ResolvedReplicationTarget;
use crate::restore::{
    MethodUsed, RestoreMethod, RestoreOutcome, RestoreRequest, RestoreStrategy, strategies_for,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "method", rename_all = "snake_case")]
pub enum GateState {
    NotStarted,
    Checking,
    Restoring(RestoreMethod),
    Completed(MethodUsed),
    Failed,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::NotStarted => f.write_str("not_started"),
            GateState::Checking => f.write_str("checking"),
            GateState::Restoring(m) => write!(f, "restoring({m})"),
            GateState::Completed(m) => write!(f, "completed({m})"),
            GateState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum AttemptResult {
    Succeeded,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub method: RestoreMethod,
    pub result: AttemptResult,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GateOutcome {
    pub states: Vec<GateState>,
    pub attempts: Vec<AttemptRecord>,
    pub method_used: Option<MethodUsed>,
    /// Marker found at entry; nothing was touched.
    pub already_complete: bool,
    pub marker: Option<PreseedState>,
}

impl GateOutcome {
    pub fn final_state(&self) -> GateState {
        self.states.last().copied().unwrap_or(GateState::NotStarted)
    }

    /// Methods that actually ran, in order.
    pub fn attempted(&self) -> Vec<RestoreMethod> {
        self.attempts
            .iter()
            .filter(|a| !matches!(a.result, AttemptResult::Skipped(_)))
            .map(|a| a.method)
            .collect()
    }

    fn push(&mut self, service: &str, state: GateState) {
        tracing::info!(service, state = %state, "preseed state");
        self.states.push(state);
    }
}

/// Everything one gate run needs for a single service. `run` decides whether
/// the mountpoint must be seeded before first start and walks the restore
/// methods in order until one succeeds.
pub struct PreseedGate<'a> {
    pub service: &'a str,
    pub dataset: &'a StoragePath,
    pub mountpoint: &'a Path,
    pub replication: Option<&'a ResolvedReplicationTarget>,
    pub strategies: &'a [Box<dyn RestoreStrategy>],
    pub timeout: Duration,
    pub host: &'a str,
}

fn promoting_sentinel(mountpoint: &Path, service: &str) -> std::path::PathBuf {
    mountpoint.join(format!("{BOOKKEEPING_PREFIX}{service}.promoting"))
}

impl PreseedGate<'_> {
    pub fn run(&self, sink: &NotificationSink, ctx: &RunCtx) -> Result<GateOutcome> {
        let svc = self.service;
        let mut out = GateOutcome::default();
        out.push(svc, GateState::NotStarted);
        ctx.check()?;
        out.push(svc, GateState::Checking);

        let marker = CompletionMarker::new(svc, self.mountpoint);
        let sentinel = promoting_sentinel(self.mountpoint, svc);
        if marker.exists() {
            let recorded = match marker.read() {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(service = svc, error = %e, "marker unreadable; still treated as complete");
                    None
                }
            };
            let _ = fsops::clear_dir_or_file(&sentinel);
            let method = recorded
                .as_ref()
                .map(|s| s.method_used)
                .unwrap_or(MethodUsed::NoneNeeded);
            tracing::info!(service = svc, marker = %marker.path().display(), "already preseeded");
            out.already_complete = true;
            out.method_used = Some(method);
            out.marker = recorded;
            out.push(svc, GateState::Completed(method));
            return Ok(out);
        }

        if !self.mountpoint.is_dir() {
            return Err(Error::msg(format!(
                "mountpoint {} for {} is not a directory (dataset {} not mounted?)",
                self.mountpoint.display(),
                svc,
                self.dataset
            )));
        }

        let swept = fsops::sweep_leftovers(self.mountpoint)?;
        if !swept.is_empty() {
            tracing::warn!(service = svc, entries = ?swept, "removed leftovers of an interrupted run");
        }

        if sentinel.exists() {
            let removed = fsops::clear_user_data(self.mountpoint)?;
            tracing::warn!(
                service = svc,
                removed,
                "previous promotion was interrupted; discarding partial data"
            );
            fsops::clear_dir_or_file(&sentinel)?;
        }

        if fsops::has_user_data(self.mountpoint)? {
            tracing::info!(service = svc, mountpoint = %self.mountpoint.display(), "mountpoint already has data; no restore needed");
            return self.complete(&mut out, &marker, MethodUsed::NoneNeeded, sink);
        }

        let mut last_error: Option<Error> = None;
        for strategy in self.strategies {
            let method = strategy.method();
            let probe = RestoreRequest {
                service: svc,
                mountpoint: self.mountpoint,
                dataset: self.dataset,
                replication: self.replication,
                staging: None,
            };
            if let Some(why) = strategy.unavailable(&probe) {
                tracing::warn!(service = svc, method = %method, reason = %why, "restore method skipped");
                out.attempts.push(AttemptRecord {
                    method,
                    result: AttemptResult::Skipped(why),
                    elapsed: Duration::ZERO,
                });
                continue;
            }

            ctx.check()?;
            out.push(svc, GateState::Restoring(method));
            let started = Instant::now();
            match self.attempt(strategy.as_ref(), ctx) {
                Ok(()) => {
                    tracing::info!(service = svc, method = %method, elapsed_ms = started.elapsed().as_millis() as u64, "restore succeeded");
                    out.attempts.push(AttemptRecord {
                        method,
                        result: AttemptResult::Succeeded,
                        elapsed: started.elapsed(),
                    });
                    let done = self.complete(&mut out, &marker, method.into(), sink);
                    let _ = fsops::clear_dir_or_file(&sentinel);
                    return done;
                }
                Err(e) if e.is_cancelled() => {
                    tracing::warn!(service = svc, method = %method, "restore interrupted; no marker written");
                    out.push(svc, GateState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(service = svc, method = %method, error = %e, "restore method failed");
                    out.attempts.push(AttemptRecord {
                        method,
                        result: AttemptResult::Failed(e.to_string()),
                        elapsed: started.elapsed(),
                    });
                    last_error = Some(e);
                }
            }
        }

        out.push(svc, GateState::Failed);
        let attempted = out.attempted();
        sink.emit(&PreseedEvent::Failed {
            service: svc.to_string(),
            host: self.host.to_string(),
            timestamp: Utc::now(),
            attempted_methods: attempted.clone(),
            last_error: last_error.as_ref().map(ToString::to_string),
        });
        let tried = attempted
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let msg = match last_error {
            Some(e) => format!("all restore methods failed for {svc} (tried: {tried}); last error: {e}"),
            None => format!("no restore method could run for {svc}"),
        };
        tracing::error!(service = svc, "{msg}");
        Err(Error::new(ErrorKind::AllMethodsExhausted, msg))
    }

    /// One bounded attempt. Staged data is promoted only after the strategy
    /// succeeded; the staging directory is removed on every path.
    fn attempt(&self, strategy: &dyn RestoreStrategy, ctx: &RunCtx) -> Result<()> {
        let staging = if strategy.needs_staging() {
            Some(
                tempfile::Builder::new()
                    .prefix(STAGING_PREFIX)
                    .tempdir_in(self.mountpoint)
                    .map_err(|e| {
                        Error::msg(format!(
                            "failed to create staging dir in {}: {e}",
                            self.mountpoint.display()
                        ))
                    })?,
            )
        } else {
            None
        };
        let req = RestoreRequest {
            service: self.service,
            mountpoint: self.mountpoint,
            dataset: self.dataset,
            replication: self.replication,
            staging: staging.as_ref().map(|d| d.path()),
        };

        let attempt_ctx = ctx.with_timeout(self.timeout);
        match strategy.attempt(&req, &attempt_ctx)? {
            RestoreOutcome::InPlace => Ok(()),
            RestoreOutcome::Staged(dir) => {
                attempt_ctx.check()?;
                let sentinel = promoting_sentinel(self.mountpoint, self.service);
                atomic_write_text(&sentinel, &Utc::now().to_rfc3339())?;
                let moved = fsops::promote(&dir, self.mountpoint)?;
                tracing::debug!(service = self.service, moved, "promoted staged data");
                Ok(())
            }
        }
    }

    fn complete(
        &self,
        out: &mut GateOutcome,
        marker: &CompletionMarker,
        method: MethodUsed,
        sink: &NotificationSink,
    ) -> Result<GateOutcome> {
        let now = Utc::now();
        match marker.write(method, now, self.dataset, self.host) {
            Ok(state) => {
                out.method_used = Some(method);
                out.marker = Some(state);
                out.push(self.service, GateState::Completed(method));
                if method != MethodUsed::NoneNeeded {
                    sink.emit(&PreseedEvent::Restored {
                        service: self.service.to_string(),
                        host: self.host.to_string(),
                        timestamp: now,
                        method,
                    });
                }
                Ok(std::mem::take(out))
            }
            Err(e) => {
                out.push(self.service, GateState::Failed);
                tracing::error!(service = self.service, error = %e, "completion marker could not be written");
                sink.emit(&PreseedEvent::Failed {
                    service: self.service.to_string(),
                    host: self.host.to_string(),
                    timestamp: now,
                    attempted_methods: out.attempted(),
                    last_error: Some(e.to_string()),
                });
                Err(Error::new(ErrorKind::MarkerWriteFailed, e.to_string()))
            }
        }
    }
}

/// Runs the gate for a configured service.
pub fn run_preseed_gate(
    cfg: &PreseedConfig,
    service: &str,
    sink: &NotificationSink,
    ctx: &RunCtx,
) -> Result<GateOutcome> {
    let svc = cfg.service(service)?;
    let replication = cfg.replication_target(&svc.dataset)?;
    let strategies = strategies_for(cfg, svc, &cfg.methods_for(svc));
    let host = fsops::hostname();
    tracing::info!(
        service,
        dataset = %svc.dataset,
        mountpoint = %svc.mountpoint.display(),
        replicated = replication.is_some(),
        "starting preseed gate"
    );
    PreseedGate {
        service,
        dataset: &svc.dataset,
        mountpoint: &svc.mountpoint,
        replication: replication.as_ref(),
        strategies: &strategies,
        timeout: cfg.timeout_for(svc),
        host: &host,
    }
    .run(sink, ctx)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDecision {
    AlreadyComplete,
    NoneNeeded,
    Restore,
    MountpointMissing,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedMethod {
    pub method: RestoreMethod,
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatePlan {
    pub service: String,
    pub dataset: String,
    pub mountpoint: String,
    pub decision: PlanDecision,
    pub replication: Option<ResolvedReplicationTarget>,
    pub timeout_secs: u64,
    pub methods: Vec<PlannedMethod>,
}

/// What `run_preseed_gate` would do, without side effects.
pub fn plan_preseed_gate(cfg: &PreseedConfig, service: &str) -> Result<GatePlan> {
    let svc = cfg.service(service)?;
    let replication = cfg.replication_target(&svc.dataset)?;
    let strategies = strategies_for(cfg, svc, &cfg.methods_for(svc));
    let probe = RestoreRequest {
        service,
        mountpoint: &svc.mountpoint,
        dataset: &svc.dataset,
        replication: replication.as_ref(),
        staging: None,
    };
    let methods = strategies
        .iter()
        .map(|s| PlannedMethod {
            method: s.method(),
            skip_reason: s.unavailable(&probe),
        })
        .collect();

    let decision = if CompletionMarker::new(service, &svc.mountpoint).exists() {
        PlanDecision::AlreadyComplete
    } else if !svc.mountpoint.is_dir() {
        PlanDecision::MountpointMissing
    } else if fsops::has_user_data(&svc.mountpoint)?
        && !promoting_sentinel(&svc.mountpoint, service).exists()
    {
        PlanDecision::NoneNeeded
    } else {
        PlanDecision::Restore
    };

    Ok(GatePlan {
        service: service.to_string(),
        dataset: svc.dataset.to_string(),
        mountpoint: svc.mountpoint.display().to_string(),
        decision,
        replication,
        timeout_secs: cfg.timeout_for(svc).as_secs(),
        methods,
    })
}
