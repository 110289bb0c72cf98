use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::PreseedConfig;
use crate::error::Result;
use crate::marker::{CompletionMarker, PreseedState};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub dataset: String,
    pub mountpoint: String,
    /// `host:dataset` of the replica, if any policy covers the dataset.
    pub replica: Option<String>,
    pub repository: Option<String>,
    pub marker: Option<PreseedState>,
    pub marker_error: Option<String>,
}

impl ServiceStatus {
    pub fn state_label(&self) -> &'static str {
        match (&self.marker, &self.marker_error) {
            (Some(_), _) => "preseeded",
            (None, Some(_)) => "unreadable",
            (None, None) => "pending",
        }
    }
}

/// Status rows for every configured service, or only `only`.
pub fn collect_status(cfg: &PreseedConfig, only: Option<&str>) -> Result<Vec<ServiceStatus>> {
    let names: Vec<&str> = match only {
        Some(name) => vec![cfg.service(name).map(|_| name)?],
        None => cfg.services.keys().map(String::as_str).collect(),
    };

    let mut rows = Vec::with_capacity(names.len());
    for name in names {
        let svc = cfg.service(name)?;
        let replica = match cfg.replication_target(&svc.dataset) {
            Ok(t) => t.map(|t| format!("{}:{}", t.target_host, t.target_dataset)),
            Err(e) => Some(format!("invalid: {e}")),
        };
        let (marker, marker_error) = match CompletionMarker::new(name, &svc.mountpoint).read() {
            Ok(m) => (m, None),
            Err(e) => (None, Some(e.to_string())),
        };
        rows.push(ServiceStatus {
            service: name.to_string(),
            dataset: svc.dataset.to_string(),
            mountpoint: svc.mountpoint.display().to_string(),
            replica,
            repository: cfg.repository_for(svc).map(|(n, _)| n.to_string()),
            marker,
            marker_error,
        });
    }
    Ok(rows)
}

pub fn time_ago(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds();
    if secs < 0 {
        return "in the future".into();
    }
    match secs {
        0..60 => "just now".into(),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

pub fn render_table(rows: &[ServiceStatus], now: DateTime<Utc>) -> String {
    let mut out = format!(
        "{:<16} {:<32} {:<11} {:<12} {:<10} {}\n",
        "SERVICE", "DATASET", "STATE", "METHOD", "WHEN", "REPLICA"
    );
    for r in rows {
        let method = r
            .marker
            .as_ref()
            .map(|m| m.method_used.as_str())
            .unwrap_or("-");
        let when = r
            .marker
            .as_ref()
            .map(|m| time_ago(now, m.restored_at))
            .unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "{:<16} {:<32} {:<11} {:<12} {:<10} {}\n",
            r.service,
            r.dataset,
            r.state_label(),
            method,
            when,
            r.replica.as_deref().unwrap_or("-")
        ));
    }
    out
}
