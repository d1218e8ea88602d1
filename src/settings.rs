use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "FINANCEFLIP_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_steps: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_steps: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceSettings {
    pub api_key: Option<String>,
    pub region: String,
    pub stt_model: String,
    pub tts_voice_id: Option<String>,
    pub tts_model: String,
    pub tts_output_format: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            region: "eu".to_string(),
            stt_model: "default".to_string(),
            tts_voice_id: None,
            tts_model: "default".to_string(),
            tts_output_format: "wav".to_string(),
        }
    }
}

impl VoiceSettings {
    pub fn stt_url(&self) -> String {
        format!("wss://{}.api.gradium.ai/api/speech/asr", self.region_or_default())
    }

    pub fn tts_url(&self) -> String {
        format!("https://{}.api.gradium.ai/api/post/speech/tts", self.region_or_default())
    }

    pub fn tts_media_type(&self) -> &'static str {
        if self.tts_output_format == "wav" {
            "audio/wav"
        } else {
            "application/octet-stream"
        }
    }

    fn region_or_default(&self) -> &str {
        if self.region.trim().is_empty() {
            "eu"
        } else {
            self.region.trim()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub cors_allow_origins: Vec<String>,
    pub llm: LlmSettings,
    pub voice: VoiceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            database_path: PathBuf::from("data/finance.db"),
            log_level: "info".to_string(),
            log_dir: None,
            cors_allow_origins: vec!["*".to_string()],
            llm: LlmSettings::default(),
            voice: VoiceSettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the YAML file named by `FINANCEFLIP_CONFIG`, then
    /// individual environment variables. Also returns the overrides that were
    /// ignored, for logging once tracing is up.
    pub fn load() -> AppResult<(Self, Vec<String>)> {
        let mut settings = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        let ignored = settings.apply_overrides(|key| std::env::var(key).ok());
        Ok((settings, ignored))
    }

    pub fn from_yaml_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            AppError::Config(format!("failed to read {}: {}", path.display(), error))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|error| AppError::Config(error.to_string()))
    }

    /// Applies environment overrides and returns a note for each value that
    /// could not be used.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());
        let mut ignored = Vec::new();

        if let Some(value) = get("FINANCEFLIP_BIND") {
            self.bind_addr = value;
        }
        if let Some(value) = get("FINANCE_DB_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = get("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = get("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CORS_ALLOW_ORIGINS") {
            self.cors_allow_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = get("LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = get("LLM_API_KEY") {
            self.llm.api_key = Some(value);
        }
        if let Some(value) = get("LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = get("LLM_TEMPERATURE") {
            match value.parse::<f32>() {
                Ok(parsed) => self.llm.temperature = parsed,
                Err(_) => ignored.push(format!("LLM_TEMPERATURE={} is not a number", value)),
            }
        }
        if let Some(value) = get("AGENT_MAX_STEPS") {
            match value.parse::<usize>() {
                Ok(parsed) if parsed > 0 => self.llm.max_steps = parsed,
                _ => ignored.push(format!("AGENT_MAX_STEPS={} is not a positive integer", value)),
            }
        }

        if let Some(value) = get("GRADIUM_API_KEY") {
            self.voice.api_key = Some(value);
        }
        if let Some(value) = get("GRADIUM_REGION") {
            self.voice.region = value;
        }
        if let Some(value) = get("GRADIUM_STT_MODEL") {
            self.voice.stt_model = value;
        }
        if let Some(value) = get("GRADIUM_TTS_VOICE_ID") {
            self.voice.tts_voice_id = Some(value);
        }
        if let Some(value) = get("GRADIUM_TTS_MODEL") {
            self.voice.tts_model = value;
        }
        if let Some(value) = get("GRADIUM_TTS_OUTPUT_FORMAT") {
            self.voice.tts_output_format = value;
        }
        ignored
    }

    pub fn require_llm_key(&self) -> AppResult<&str> {
        non_blank(self.llm.api_key.as_deref())
            .ok_or_else(|| AppError::Config("LLM_API_KEY not configured".to_string()))
    }

    pub fn require_voice_key(&self) -> AppResult<&str> {
        non_blank(self.voice.api_key.as_deref())
            .ok_or_else(|| AppError::Config("GRADIUM_API_KEY not configured".to_string()))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
