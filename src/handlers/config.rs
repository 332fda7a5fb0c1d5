use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The configuration as shown to API clients. API keys are reported as set or not,
/// never echoed.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "stt": {
            "url": config.stt.url,
            "model": config.stt.model,
            "encoding": config.stt.encoding,
            "sample_rate": config.stt.sample_rate,
            "open_attempts": config.stt.open_attempts,
            "open_backoff_ms": config.stt.open_backoff_ms,
            "api_key_set": !config.stt.api_key.is_empty()
        },
        "llm": {
            "base_url": config.llm.base_url,
            "model": config.llm.model,
            "system_prompt": config.llm.system_prompt,
            "max_history_messages": config.llm.max_history_messages,
            "max_conversations": config.llm.max_conversations,
            "api_key_set": !config.llm.api_key.is_empty()
        },
        "tts": {
            "url": config.tts.url,
            "model": config.tts.model,
            "min_chunk_chars": config.tts.min_chunk_chars,
            "api_key_set": !config.tts.api_key.is_empty()
        },
        "session": {
            "finalize_timeout_ms": config.session.finalize_timeout_ms,
            "max_pending_audio_frames": config.session.max_pending_audio_frames,
            "max_concurrent_sessions": config.session.max_concurrent_sessions
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Apply a partial configuration update.
///
/// Session tuning applies to sessions opened afterwards; the LLM prompt and history
/// limits apply from the next reply. Fields fixed at startup are refused with 400.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}
