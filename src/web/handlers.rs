//! HTTP request handlers.

use super::AppState;
use crate::db::{Monitor, MonitorSlaPolicy, MonitorState, PeriodType};
use crate::scheduler::{last_complete_period, Tuning};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub async fn handle_get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.stats_snapshot())
}

/// A monitor with its current runtime state.
#[derive(Debug, Serialize)]
pub struct MonitorView {
    #[serde(flatten)]
    pub monitor: Monitor,
    pub state: Option<MonitorState>,
}

pub async fn handle_get_monitors(State(state): State<AppState>) -> impl IntoResponse {
    let monitors = match state.store.list_monitors().await {
        Ok(monitors) => monitors,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let mut views = Vec::with_capacity(monitors.len());
    for monitor in monitors {
        let current = match state.store.get_monitor_state(monitor.id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(monitor_id = monitor.id, error = %e, "Failed to load monitor state");
                None
            }
        };
        views.push(MonitorView {
            monitor,
            state: current,
        });
    }
    Json(views).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SlaQuery {
    pub period: Option<String>,
}

pub async fn handle_get_monitor_sla(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<SlaQuery>,
) -> impl IntoResponse {
    let period = match query.period.as_deref() {
        None => PeriodType::Day,
        Some(raw) => match PeriodType::parse(raw) {
            Some(p) => p,
            None => return (StatusCode::BAD_REQUEST, "Invalid period").into_response(),
        },
    };

    let monitor = match state.store.get_monitor(id).await {
        Ok(Some(m)) => m,
        Ok(None) => return (StatusCode::NOT_FOUND, "Monitor not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let policy = match state.store.list_sla_policies().await {
        Ok(policies) => policies
            .into_iter()
            .find(|p| p.monitor_id == id)
            .unwrap_or_else(|| MonitorSlaPolicy::default_for(id)),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let (from, to) = last_complete_period(period, Utc::now());
    match state
        .engine
        .evaluate_monitor_sla_window(&monitor, &policy, from, to)
        .await
    {
        Ok(evaluation) => Json(evaluation).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_put_tuning(
    State(state): State<AppState>,
    Json(tuning): Json<Tuning>,
) -> impl IntoResponse {
    Json(state.engine.set_tuning(tuning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, MonitorStatus, MonitorStore};
    use crate::notify::{Coordinator, PlaintextDecryptor};
    use crate::probe::{CheckResult, CheckRunner, ProbeError, TargetPolicy};
    use crate::scheduler::{Engine, EngineOptions};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use std::sync::Arc;

    struct AlwaysUp;

    #[async_trait]
    impl CheckRunner for AlwaysUp {
        async fn run(&self, _monitor: &Monitor, _policy: TargetPolicy) -> (CheckResult, Option<ProbeError>) {
            (CheckResult::new(Utc::now()).succeeded(), None)
        }
    }

    fn app_state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            None,
            Arc::new(PlaintextDecryptor),
        ));
        let engine = Engine::new(store.clone(), Arc::new(AlwaysUp), coordinator, EngineOptions::default());
        (
            AppState {
                engine,
                store: store.clone(),
            },
            store,
        )
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_monitors_include_state() {
        let (state, store) = app_state();
        store.add_monitor(Monitor {
            id: 1,
            name: "api".to_string(),
            ..Default::default()
        });
        let mut ms = MonitorState::new(1);
        ms.status = MonitorStatus::Up;
        store.upsert_monitor_state(&ms).await.unwrap();

        let response = handle_get_monitors(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["name"], "api");
        assert_eq!(body[0]["state"]["status"], "up");
    }

    #[tokio::test]
    async fn test_sla_endpoint_validation() {
        let (state, store) = app_state();
        store.add_monitor(Monitor {
            id: 1,
            ..Default::default()
        });

        let bad = handle_get_monitor_sla(
            State(state.clone()),
            Path(1),
            Query(SlaQuery {
                period: Some("year".to_string()),
            }),
        )
        .await
        .into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = handle_get_monitor_sla(State(state.clone()), Path(9), Query(SlaQuery { period: None }))
            .await
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let ok = handle_get_monitor_sla(
            State(state),
            Path(1),
            Query(SlaQuery {
                period: Some("week".to_string()),
            }),
        )
        .await
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert_eq!(body["status"], "unknown");
        assert_eq!(body["observed_checks"], 0);
    }

    #[tokio::test]
    async fn test_put_tuning_applies_clamped_values() {
        let (state, _) = app_state();
        let response = handle_put_tuning(
            State(state.clone()),
            Json(Tuning {
                jitter_percent: 75,
                jitter_max_seconds: 5,
                stats_log_interval_seconds: 0,
            }),
        )
        .await
        .into_response();
        let body = body_json(response).await;
        assert_eq!(body["jitter_percent"], 50);

        let stats = body_json(handle_get_stats(State(state)).await.into_response()).await;
        assert_eq!(stats["tuning"]["jitter_max_seconds"], 5);
        assert_eq!(stats["running"], false);
    }
}
