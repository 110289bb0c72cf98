use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{NotifySettings, resolve_env_ref, resolve_string_field};
use crate::error::{Error, Result};
use crate::exec::RunCtx;
use crate::restore::{MethodUsed, RestoreMethod};

const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PreseedEvent {
    Failed {
        service: String,
        host: String,
        timestamp: DateTime<Utc>,
        attempted_methods: Vec<RestoreMethod>,
        last_error: Option<String>,
    },
    Restored {
        service: String,
        host: String,
        timestamp: DateTime<Utc>,
        method: MethodUsed,
    },
}

impl PreseedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PreseedEvent::Failed { .. } => "failed",
            PreseedEvent::Restored { .. } => "restored",
        }
    }

    pub fn service(&self) -> &str {
        match self {
            PreseedEvent::Failed { service, .. } | PreseedEvent::Restored { service, .. } => {
                service
            }
        }
    }

    pub fn host(&self) -> &str {
        match self {
            PreseedEvent::Failed { host, .. } | PreseedEvent::Restored { host, .. } => host,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PreseedEvent::Failed { timestamp, .. } | PreseedEvent::Restored { timestamp, .. } => {
                *timestamp
            }
        }
    }

    pub fn summary(&self) -> String {
        match self {
            PreseedEvent::Failed {
                service,
                host,
                attempted_methods,
                last_error,
                ..
            } => {
                let tried = attempted_methods
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "preseed for {service} on {host} failed after [{tried}]: {}",
                    last_error.as_deref().unwrap_or("no method could run")
                )
            }
            PreseedEvent::Restored {
                service,
                host,
                method,
                ..
            } => format!("preseed for {service} on {host} restored via {method}"),
        }
    }

    /// `PRESEED_*` variables handed to command notifiers.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("PRESEED_EVENT", self.kind().to_string()),
            ("PRESEED_SERVICE", self.service().to_string()),
            ("PRESEED_HOST", self.host().to_string()),
            ("PRESEED_TIMESTAMP", self.timestamp().to_rfc3339()),
            ("PRESEED_SUMMARY", self.summary()),
        ];
        match self {
            PreseedEvent::Failed {
                attempted_methods,
                last_error,
                ..
            } => {
                let tried = attempted_methods
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                env.push(("PRESEED_ATTEMPTED", tried));
                env.push(("PRESEED_ERROR", last_error.clone().unwrap_or_default()));
            }
            PreseedEvent::Restored { method, .. } => {
                env.push(("PRESEED_METHOD", method.as_str().to_string()));
            }
        }
        env
    }
}

pub trait Notifier {
    fn name(&self) -> &str;
    fn notify(&self, ev: &PreseedEvent) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, ev: &PreseedEvent) -> Result<()> {
        match ev {
            PreseedEvent::Failed { .. } => {
                tracing::error!(service = ev.service(), event = ev.kind(), "{}", ev.summary())
            }
            PreseedEvent::Restored { .. } => {
                tracing::info!(service = ev.service(), event = ev.kind(), "{}", ev.summary())
            }
        }
        Ok(())
    }
}

/// POSTs the event as JSON.
#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url, token, client })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn notify(&self, ev: &PreseedEvent) -> Result<()> {
        let mut req = self.client.post(&self.url).json(ev);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("webhook delivery failed: {e}")))?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(Error::msg(format!(
            "webhook returned {} for {} event",
            res.status(),
            ev.kind()
        )))
    }
}

/// Runs a configured argv with the event in `PRESEED_*` variables.
#[derive(Debug)]
pub struct CommandNotifier {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(Error::config("notify.command must name a program"));
        }
        Ok(Self { argv, timeout })
    }
}

impl Notifier for CommandNotifier {
    fn name(&self) -> &str {
        "command"
    }

    fn notify(&self, ev: &PreseedEvent) -> Result<()> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.envs(ev.env());
        RunCtx::default().with_timeout(self.timeout).run(cmd)
    }
}

/// Fans events out to every configured backend. Delivery problems are
/// logged and never reach the caller.
pub struct NotificationSink {
    on_success: bool,
    backends: Vec<Box<dyn Notifier>>,
}

impl NotificationSink {
    pub fn new(on_success: bool, backends: Vec<Box<dyn Notifier>>) -> Self {
        Self {
            on_success,
            backends,
        }
    }

    pub fn from_settings(cfg: &NotifySettings) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_secs.unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS));
        let mut backends: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];

        match resolve_string_field(cfg.webhook_url.as_deref(), cfg.webhook_url_env.as_deref()) {
            Some(url) => {
                let token = resolve_env_ref(cfg.token_env.as_deref());
                backends.push(Box::new(WebhookNotifier::new(url, token, timeout)?));
            }
            None => {
                if let Some(k) = cfg.webhook_url_env.as_deref() {
                    tracing::warn!(env = k, "webhook url env var is unset; webhook disabled");
                }
            }
        }
        if !cfg.command.is_empty() {
            backends.push(Box::new(CommandNotifier::new(cfg.command.clone(), timeout)?));
        }
        Ok(Self::new(cfg.on_success, backends))
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn emit(&self, ev: &PreseedEvent) {
        if matches!(ev, PreseedEvent::Restored { .. }) && !self.on_success {
            return;
        }
        for b in &self.backends {
            if let Err(e) = b.notify(ev) {
                tracing::warn!(
                    backend = b.name(),
                    service = ev.service(),
                    error = %e,
                    "notification failed"
                );
            }
        }
    }
}

impl Default for NotificationSink {
    fn default() -> Self {
        Self::new(false, vec![Box::new(LogNotifier)])
    }
}
