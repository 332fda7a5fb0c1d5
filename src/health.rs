//! Health and metrics endpoints.

use crate::config::AppConfig;
use crate::state::{AppState, MetricsSnapshot};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-turn-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions
        },
        "providers": {
            "stt": { "model": config.stt.model, "configured": !config.stt.api_key.is_empty() },
            "llm": { "model": config.llm.model, "configured": !config.llm.api_key.is_empty() },
            "tts": { "model": config.tts.model, "configured": !config.tts.api_key.is_empty() }
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "conversation": metrics,
        "turns_per_minute": if uptime_seconds > 0 {
            metrics.turns_completed as f64 * 60.0 / uptime_seconds as f64
        } else {
            0.0
        },
        "memory": get_memory_info(),
        "limits": {
            "max_concurrent_sessions": config.session.max_concurrent_sessions,
            "max_pending_audio_frames": config.session.max_pending_audio_frames,
            "finalize_timeout_ms": config.session.finalize_timeout_ms
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {} on this platform", process::id())
    })
}

fn get_system_status(config: &AppConfig, metrics: &MetricsSnapshot) -> serde_json::Value {
    let max_sessions = config.session.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "full"
    } else if session_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    let mut warnings = Vec::new();
    if session_usage > 0.8 {
        warnings.push("High session usage - consider increasing max_concurrent_sessions");
    }
    if metrics.fatal_errors > 0 {
        warnings.push("Sessions have ended on fatal errors - check provider connectivity");
    }

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": warnings
    })
}
