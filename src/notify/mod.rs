//! Notification and auto-incident coordination.
//!
//! [`plan_transition`] is a pure edge detector over `(previous, next)` monitor
//! state; [`Coordinator`] carries the plan out through the injected sender,
//! incident gateway and audit log. Every side effect is best-effort: failures
//! are logged and never reach the scheduling tick.

pub mod telegram;

pub use telegram::{PlaintextDecryptor, TelegramSender};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{
    AuditLogger, IncidentsGateway, Monitor, MonitorSlaPeriodResult, MonitorState, MonitorStatus,
    MonitorStore, NewIncident, NotificationState,
};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {status}: {description}")]
    Api { status: u16, description: String },
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("secret decryption failed: {0}")]
    Decrypt(String),
}

/// A Telegram-shaped outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub token: String,
    pub chat_id: String,
    pub text: String,
    pub disable_preview: bool,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError>;
}

/// Decrypts stored channel credentials.
pub trait SecretDecryptor: Send + Sync {
    fn decrypt_blob(&self, ciphertext: &str) -> Result<String, NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSettings {
    pub enabled: bool,
    /// Bot token as stored; passed through the decryptor before use.
    pub token_ciphertext: String,
    pub chat_id: String,
    pub down_suppress: Duration,
    pub up_suppress: Duration,
    pub tls_suppress: Duration,
    pub tls_expiry_threshold_days: i64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            token_ciphertext: String::new(),
            chat_id: String::new(),
            down_suppress: Duration::from_secs(10 * 60),
            up_suppress: Duration::from_secs(10 * 60),
            tls_suppress: Duration::from_secs(24 * 60 * 60),
            tls_expiry_threshold_days: 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Down,
    Up,
    TlsExpiry,
    MaintenanceStarted,
    MaintenanceEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentAction {
    Open,
    Close,
}

/// What a transition should trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionPlan {
    pub alerts: Vec<AlertKind>,
    pub incident: Option<IncidentAction>,
}

fn suppressed(last: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    match last {
        Some(at) => {
            let window = chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            now < at + window
        }
        None => false,
    }
}

/// Decide which alerts and incident actions a state change triggers.
///
/// Up/down edges compare against the last non-maintenance status the
/// coordinator saw, so a monitor that went down before a maintenance window
/// and came back up after it still produces the up edge.
pub fn plan_transition(
    monitor: &Monitor,
    previous: Option<&MonitorState>,
    next: &MonitorState,
    notified: &NotificationState,
    settings: &NotificationSettings,
    now: DateTime<Utc>,
) -> TransitionPlan {
    let mut plan = TransitionPlan::default();
    if monitor.paused || next.status == MonitorStatus::Paused {
        return plan;
    }

    let was_in_maintenance = previous.map_or(false, |p| p.maintenance_active);
    if next.maintenance_active {
        if !was_in_maintenance {
            plan.alerts.push(AlertKind::MaintenanceStarted);
        }
        return plan;
    }
    if was_in_maintenance {
        plan.alerts.push(AlertKind::MaintenanceEnded);
    }

    let last_status = notified
        .last_status
        .or_else(|| previous.map(|p| p.status))
        .unwrap_or_default();

    if next.status == MonitorStatus::Down && last_status != MonitorStatus::Down {
        if !suppressed(notified.last_down_notified_at, settings.down_suppress, now) {
            plan.alerts.push(AlertKind::Down);
        }
        if monitor.auto_incident {
            plan.incident = Some(IncidentAction::Open);
        }
    } else if next.status == MonitorStatus::Up && last_status == MonitorStatus::Down {
        if !suppressed(notified.last_up_notified_at, settings.up_suppress, now) {
            plan.alerts.push(AlertKind::Up);
        }
        plan.incident = Some(IncidentAction::Close);
    }

    if let Some(days) = next.tls_days_left {
        let threshold = settings.tls_expiry_threshold_days;
        let was_above = previous
            .and_then(|p| p.tls_days_left)
            .map_or(true, |prev| prev > threshold);
        if days <= threshold
            && was_above
            && !suppressed(notified.last_tls_notified_at, settings.tls_suppress, now)
        {
            plan.alerts.push(AlertKind::TlsExpiry);
        }
    }

    plan
}

/// Render the alert text. Kept plain; channel formatting is the sender's job.
pub fn format_alert(kind: AlertKind, monitor: &Monitor, state: &MonitorState) -> String {
    let name = if monitor.name.is_empty() {
        monitor.target.as_str()
    } else {
        monitor.name.as_str()
    };
    match kind {
        AlertKind::Down => format!(
            "DOWN: {} ({})\nreason: {}",
            name,
            monitor.target,
            state
                .last_error_kind
                .map(|k| k.as_str())
                .unwrap_or("unknown")
        ),
        AlertKind::Up => format!(
            "UP: {} ({}) latency {}ms",
            name,
            monitor.target,
            state.last_latency_ms.unwrap_or_default()
        ),
        AlertKind::TlsExpiry => format!(
            "TLS: certificate for {} expires in {} days",
            name,
            state.tls_days_left.unwrap_or_default()
        ),
        AlertKind::MaintenanceStarted => format!("MAINTENANCE: {} entered maintenance", name),
        AlertKind::MaintenanceEnded => format!("MAINTENANCE: {} left maintenance", name),
    }
}

/// Executes transition plans against the injected collaborators.
pub struct Coordinator {
    store: Arc<dyn MonitorStore>,
    incidents: Arc<dyn IncidentsGateway>,
    audit: Arc<dyn AuditLogger>,
    sender: Option<Arc<dyn NotificationSender>>,
    decryptor: Arc<dyn SecretDecryptor>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        incidents: Arc<dyn IncidentsGateway>,
        audit: Arc<dyn AuditLogger>,
        sender: Option<Arc<dyn NotificationSender>>,
        decryptor: Arc<dyn SecretDecryptor>,
    ) -> Self {
        Self {
            store,
            incidents,
            audit,
            sender,
            decryptor,
        }
    }

    /// React to a persisted state change. Never fails.
    pub async fn on_transition(
        &self,
        monitor: &Monitor,
        previous: Option<&MonitorState>,
        next: &MonitorState,
        settings: &NotificationSettings,
        now: DateTime<Utc>,
    ) {
        let mut notified = match self.store.get_notification_state(monitor.id).await {
            Ok(Some(state)) => state,
            Ok(None) => NotificationState::new(monitor.id),
            Err(e) => {
                tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to load notification state");
                NotificationState::new(monitor.id)
            }
        };

        let plan = plan_transition(monitor, previous, next, &notified, settings, now);

        for kind in &plan.alerts {
            let text = format_alert(*kind, monitor, next);
            if self.deliver(settings, text).await {
                match kind {
                    AlertKind::Down => notified.last_down_notified_at = Some(now),
                    AlertKind::Up => notified.last_up_notified_at = Some(now),
                    AlertKind::TlsExpiry => notified.last_tls_notified_at = Some(now),
                    AlertKind::MaintenanceStarted | AlertKind::MaintenanceEnded => {
                        notified.last_maintenance_notified_at = Some(now)
                    }
                }
                tracing::info!(monitor_id = monitor.id, alert = ?kind, "Alert sent");
            }
        }

        match plan.incident {
            Some(IncidentAction::Open) => self.open_monitor_incident(monitor, next, now).await,
            Some(IncidentAction::Close) => self.close_monitor_incident(monitor, now).await,
            None => {}
        }

        let before = notified.last_status;
        if !next.maintenance_active && next.status != MonitorStatus::Maintenance {
            notified.last_status = Some(next.status);
        }
        if !plan.alerts.is_empty() || before != notified.last_status {
            if let Err(e) = self.store.upsert_notification_state(&notified).await {
                tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to save notification state");
            }
        }
    }

    /// Send one message; returns whether it was delivered.
    async fn deliver(&self, settings: &NotificationSettings, text: String) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        if !settings.enabled {
            return false;
        }
        let token = match self.decryptor.decrypt_blob(&settings.token_ciphertext) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decrypt notification token");
                return false;
            }
        };
        let message = OutboundMessage {
            token,
            chat_id: settings.chat_id.clone(),
            text,
            disable_preview: true,
        };
        match sender.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send notification");
                false
            }
        }
    }

    async fn open_monitor_incident(&self, monitor: &Monitor, state: &MonitorState, now: DateTime<Utc>) {
        let source = monitor.incident_source();
        match self.incidents.find_open_incident_by_source(&source).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to look up open incident");
                return;
            }
        }

        let reason = state
            .last_error_kind
            .map(|k| k.as_str())
            .unwrap_or("unknown");
        let incident = NewIncident {
            source,
            title: format!("{} is down", display_name(monitor)),
            severity: monitor.incident_severity.clone(),
            description: format!("Automatic incident: {} failed with {}", monitor.target, reason),
            opened_at: now,
        };
        let created = match self.incidents.create_incident(incident).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(monitor_id = monitor.id, error = %e, "Failed to create incident");
                return;
            }
        };

        tracing::info!(monitor_id = monitor.id, incident_id = created.id, "Auto-incident opened");
        self.timeline(created.id, now, &format!("Monitor down ({})", reason)).await;
        self.audit(
            "incident.auto_open",
            serde_json::json!({ "monitor_id": monitor.id, "incident_id": created.id, "reason": reason }),
        )
        .await;
    }

    async fn close_monitor_incident(&self, monitor: &Monitor, now: DateTime<Utc>) {
        let open = match self
            .incidents
            .find_open_incident_by_source(&monitor.incident_source())
            .await
        {
            Ok(Some(incident)) => incident,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to look up open incident");
                return;
            }
        };

        self.timeline(open.id, now, "Monitor recovered").await;
        if let Err(e) = self.incidents.close_incident(open.id, now).await {
            tracing::error!(incident_id = open.id, error = %e, "Failed to close incident");
            return;
        }
        tracing::info!(monitor_id = monitor.id, incident_id = open.id, "Auto-incident closed");
        self.audit(
            "incident.auto_close",
            serde_json::json!({ "monitor_id": monitor.id, "incident_id": open.id }),
        )
        .await;
    }

    /// Open an incident for a violated SLA period. Returns whether one now exists.
    pub async fn open_sla_incident(
        &self,
        monitor: &Monitor,
        result: &MonitorSlaPeriodResult,
        now: DateTime<Utc>,
    ) -> bool {
        let source = format!(
            "sla:{}:{}:{}",
            monitor.id,
            result.period_type.as_str(),
            result.period_start.format("%Y-%m-%d")
        );
        match self.incidents.find_open_incident_by_source(&source).await {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to look up SLA incident");
                return false;
            }
        }

        let incident = NewIncident {
            source,
            title: format!(
                "SLA violated: {} ({} from {})",
                display_name(monitor),
                result.period_type.as_str(),
                result.period_start.format("%Y-%m-%d")
            ),
            severity: monitor.incident_severity.clone(),
            description: format!(
                "Uptime {:.3}% below target {:.3}% (coverage {:.1}%)",
                result.uptime_pct, result.target_pct, result.coverage_pct
            ),
            opened_at: now,
        };
        match self.incidents.create_incident(incident).await {
            Ok(created) => {
                tracing::info!(monitor_id = monitor.id, incident_id = created.id, "SLA incident opened");
                self.timeline(created.id, now, "SLA period closed as violated").await;
                self.audit(
                    "incident.sla_open",
                    serde_json::json!({
                        "monitor_id": monitor.id,
                        "incident_id": created.id,
                        "period_type": result.period_type.as_str(),
                        "period_start": result.period_start,
                    }),
                )
                .await;
                true
            }
            Err(e) => {
                tracing::error!(monitor_id = monitor.id, error = %e, "Failed to create SLA incident");
                false
            }
        }
    }

    async fn timeline(&self, incident_id: i64, at: DateTime<Utc>, message: &str) {
        if let Err(e) = self.incidents.add_incident_timeline(incident_id, at, message).await {
            tracing::warn!(incident_id, error = %e, "Failed to add incident timeline entry");
        }
    }

    async fn audit(&self, action: &str, details: serde_json::Value) {
        if let Err(e) = self.audit.log("system", action, details).await {
            tracing::warn!(action, error = %e, "Failed to write audit log");
        }
    }
}

fn display_name(monitor: &Monitor) -> &str {
    if monitor.name.is_empty() {
        &monitor.target
    } else {
        &monitor.name
    }
}
