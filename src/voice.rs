use crate::errors::{AppError, AppResult};
use crate::models::TtsRequest;
use crate::server::AppState;
use crate::settings::VoiceSettings;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

const TTS_TIMEOUT: Duration = Duration::from_secs(60);
const TTS_FAILURE_DETAIL: &str = "Gradium TTS failed";
const API_KEY_HEADER: &str = "x-api-key";

pub fn synthesis_payload(voice: &VoiceSettings, text: &str) -> serde_json::Value {
    json!({
        "text": text,
        "voice_id": voice.tts_voice_id,
        "model_name": voice.tts_model,
        "output_format": voice.tts_output_format,
        "only_audio": true,
    })
}

pub fn transcription_setup(voice: &VoiceSettings) -> serde_json::Value {
    json!({
        "type": "setup",
        "model_name": voice.stt_model,
        "input_format": "pcm",
    })
}

/// Wraps one raw PCM frame from the browser for the recognizer.
pub fn audio_frame(pcm: &[u8]) -> serde_json::Value {
    json!({ "type": "audio", "audio": STANDARD.encode(pcm) })
}

fn error_frame(detail: &str) -> String {
    json!({ "type": "error", "detail": detail }).to_string()
}

pub async fn tts(
    State(state): State<AppState>,
    Json(request): Json<TtsRequest>,
) -> Result<Response, AppError> {
    let voice = &state.settings.voice;
    let api_key = state.settings.require_voice_key()?;
    let text = request.text.as_deref().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err(AppError::InvalidRequest("Text is required".to_string()));
    }

    let response = state
        .http
        .post(voice.tts_url())
        .header(API_KEY_HEADER, api_key)
        .timeout(TTS_TIMEOUT)
        .json(&synthesis_payload(voice, text))
        .send()
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "speech synthesis request failed");
            AppError::Upstream(TTS_FAILURE_DETAIL.to_string())
        })?;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = status.as_u16(), body = %body, "speech synthesis rejected");
        return Err(AppError::Upstream(TTS_FAILURE_DETAIL.to_string()));
    }

    let audio = response.bytes().await.map_err(|error| {
        tracing::error!(error = %error, "speech synthesis body unreadable");
        AppError::Upstream(TTS_FAILURE_DETAIL.to_string())
    })?;
    Ok(([(header::CONTENT_TYPE, voice.tts_media_type())], audio).into_response())
}

pub async fn stt(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| proxy_transcription(socket, state))
}

async fn proxy_transcription(socket: WebSocket, state: AppState) {
    let (mut client_tx, mut client_rx) = socket.split();

    let result = match state.settings.require_voice_key() {
        Ok(api_key) => relay(&mut client_tx, &mut client_rx, &state.settings.voice, api_key).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => {
            let _ = client_tx.close().await;
        }
        Err(error) => {
            tracing::warn!(error = %error, "transcription proxy closed with error");
            let _ = client_tx
                .send(Message::Text(error_frame(&error.detail()).into()))
                .await;
            let _ = client_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: String::new().into(),
                })))
                .await;
        }
    }
}

/// Pumps audio up and transcripts down until either side finishes. The first
/// direction to end stops the other.
async fn relay(
    client_tx: &mut SplitSink<WebSocket, Message>,
    client_rx: &mut SplitStream<WebSocket>,
    voice: &VoiceSettings,
    api_key: &str,
) -> AppResult<()> {
    let mut request = voice.stt_url().into_client_request().map_err(upstream)?;
    let key = tungstenite::http::HeaderValue::from_str(api_key)
        .map_err(|error| AppError::Config(format!("invalid GRADIUM_API_KEY: {}", error)))?;
    request.headers_mut().insert(API_KEY_HEADER, key);

    let (upstream_socket, _) = tokio_tungstenite::connect_async(request).await.map_err(upstream)?;
    let (mut upstream_tx, mut upstream_rx) = upstream_socket.split();
    upstream_tx
        .send(tungstenite::Message::Text(transcription_setup(voice).to_string().into()))
        .await
        .map_err(upstream)?;
    tracing::info!(model = %voice.stt_model, "transcription session opened");

    let client_to_upstream = async {
        while let Some(message) = client_rx.next().await {
            let outgoing = match message {
                Ok(Message::Binary(pcm)) => audio_frame(&pcm).to_string(),
                Ok(Message::Text(text)) => text.as_str().to_string(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            upstream_tx
                .send(tungstenite::Message::Text(outgoing.into()))
                .await
                .map_err(upstream)?;
        }
        Ok::<(), AppError>(())
    };

    let upstream_to_client = async {
        while let Some(message) = upstream_rx.next().await {
            match message.map_err(upstream)? {
                tungstenite::Message::Text(text) => {
                    if client_tx
                        .send(Message::Text(text.as_str().to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                tungstenite::Message::Close(_) => break,
                _ => {}
            }
        }
        Ok::<(), AppError>(())
    };

    tokio::select! {
        result = client_to_upstream => result,
        result = upstream_to_client => result,
    }
}

fn upstream(error: tungstenite::Error) -> AppError {
    AppError::Upstream(format!("speech recognition connection failed: {}", error))
}
