//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{QualityTier, DEFAULT_APPROVAL_THRESHOLD};

/// Top-level tutorflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<ProvidersConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extractor: Option<ExtractorConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Generation providers ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// OpenAI-compatible endpoints, tried in order (first is primary).
    #[serde(default)]
    pub endpoints: Vec<ProviderConfig>,

    /// Model per responder quality tier.
    #[serde(default)]
    pub tiers: TierModels,

    /// Model used by the validation gate (defaults to the premium tier model).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_model: Option<String>,

    /// Model used by the LLM selection policy (defaults to the fast tier model).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Configuration for a single OpenAI-compatible provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierModels {
    #[serde(default = "default_fast_model")]
    pub fast: String,
    #[serde(default = "default_standard_model")]
    pub standard: String,
    #[serde(default = "default_premium_model")]
    pub premium: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            fast: default_fast_model(),
            standard: default_standard_model(),
            premium: default_premium_model(),
        }
    }
}

fn default_fast_model() -> String {
    "gpt-4o-mini".into()
}

fn default_standard_model() -> String {
    "gpt-4o-mini".into()
}

fn default_premium_model() -> String {
    "gpt-4o".into()
}

// --- Speech synthesis ---

/// Text-to-speech provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Provider: "elevenlabs" (default).
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Default voice ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,

    /// Default model ID (e.g. "eleven_turbo_v2").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Output format (default: "mp3_44100_128").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,

    /// Provider-imposed character ceiling per request.
    #[serde(default = "default_tts_max_chars")]
    pub max_chars: usize,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

fn default_tts_max_chars() -> usize {
    500
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Pipeline sections ---

/// Which selection policy the router uses when no responder is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Llm,
    Keyword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Responder used when selection is unavailable or unparseable.
    pub default_responder: String,

    /// Responder forced after a lesson-complete signal.
    pub assessment_responder: String,

    /// Number of turns kept in the rolling session history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub policy: PolicyKind,

    /// Upper bound on a selection-policy call, in milliseconds.
    #[serde(default = "default_policy_timeout_ms")]
    pub policy_timeout_ms: u64,
}

fn default_history_limit() -> usize {
    6
}

fn default_policy_timeout_ms() -> u64 {
    5_000
}

/// Sentence boundary tuning. The abbreviation list and leftover length are
/// tunables, not contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_abbreviations")]
    pub abbreviations: Vec<String>,

    /// Leftover text at stream end must be longer than this (in chars) to get its own job.
    #[serde(default = "default_min_significant_chars")]
    pub min_significant_chars: usize,

    /// Character ceiling per unit; longer sentences are split at clause boundaries.
    #[serde(default = "default_tts_max_chars")]
    pub max_chars: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            abbreviations: default_abbreviations(),
            min_significant_chars: default_min_significant_chars(),
            max_chars: default_tts_max_chars(),
        }
    }
}

pub fn default_abbreviations() -> Vec<String> {
    [
        "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "approx",
        "fig", "vol", "ca",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_significant_chars() -> usize {
    12
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Maximum number of concurrently running synthesis jobs per turn.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Failed jobs per turn at which progressive mode is abandoned.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Retries per job after the first failure.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            failure_threshold: default_failure_threshold(),
            retries: default_retries(),
        }
    }
}

fn default_max_concurrency() -> usize {
    6
}

fn default_failure_threshold() -> usize {
    3
}

fn default_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Hard wall-clock deadline for one validation call.
    #[serde(default = "default_validation_timeout_ms")]
    pub timeout_ms: u64,

    /// Generation attempts per turn, including the first draft.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            timeout_ms: default_validation_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f64 {
    DEFAULT_APPROVAL_THRESHOLD
}

fn default_validation_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory of responder YAML files (default: "responders/" in the data dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// How long a loaded catalog is served before re-reading the directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Custom session storage directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Keep sessions in memory only.
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "tutorflow_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::TutorError::Io)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| crate::error::TutorError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(18790)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Model for a responder quality tier.
    pub fn model_for_tier(&self, tier: QualityTier) -> String {
        let tiers = self
            .providers
            .as_ref()
            .map(|p| p.tiers.clone())
            .unwrap_or_default();
        match tier {
            QualityTier::Fast => tiers.fast,
            QualityTier::Standard => tiers.standard,
            QualityTier::Premium => tiers.premium,
        }
    }

    pub fn validation_model(&self) -> String {
        self.providers
            .as_ref()
            .and_then(|p| p.validation_model.clone())
            .unwrap_or_else(|| self.model_for_tier(QualityTier::Premium))
    }

    pub fn routing_model(&self) -> String {
        self.providers
            .as_ref()
            .and_then(|p| p.routing_model.clone())
            .unwrap_or_else(|| self.model_for_tier(QualityTier::Fast))
    }

    /// Get the default max_tokens.
    pub fn max_tokens(&self) -> u32 {
        self.providers
            .as_ref()
            .and_then(|p| p.max_tokens)
            .unwrap_or(1024)
    }

    /// Get temperature setting.
    pub fn temperature(&self) -> Option<f64> {
        self.providers.as_ref().and_then(|p| p.temperature)
    }

    /// Configured generation endpoints in priority order.
    pub fn endpoints(&self) -> &[ProviderConfig] {
        self.providers
            .as_ref()
            .map(|p| p.endpoints.as_slice())
            .unwrap_or(&[])
    }

    pub fn default_responder(&self) -> String {
        self.routing
            .as_ref()
            .map(|r| r.default_responder.clone())
            .unwrap_or_else(|| "general".to_string())
    }

    pub fn assessment_responder(&self) -> String {
        self.routing
            .as_ref()
            .map(|r| r.assessment_responder.clone())
            .unwrap_or_else(|| "assessment".to_string())
    }

    pub fn history_limit(&self) -> usize {
        self.routing
            .as_ref()
            .map(|r| r.history_limit)
            .unwrap_or_else(default_history_limit)
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.routing.as_ref().map(|r| r.policy).unwrap_or_default()
    }

    pub fn policy_timeout(&self) -> Duration {
        Duration::from_millis(
            self.routing
                .as_ref()
                .map(|r| r.policy_timeout_ms)
                .unwrap_or_else(default_policy_timeout_ms),
        )
    }

    pub fn extractor(&self) -> ExtractorConfig {
        let mut extractor = self.extractor.clone().unwrap_or_default();
        // A unit may never exceed what the synthesis provider accepts.
        if let Some(tts) = &self.tts {
            extractor.max_chars = extractor.max_chars.min(tts.max_chars);
        }
        extractor
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        self.synthesis.clone().unwrap_or_default()
    }

    pub fn validation(&self) -> ValidationConfig {
        self.validation.clone().unwrap_or_default()
    }

    /// Resolve the responder directory.
    pub fn registry_dir(&self) -> PathBuf {
        self.registry
            .as_ref()
            .and_then(|r| r.dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("responders"))
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(
            self.registry
                .as_ref()
                .and_then(|r| r.cache_ttl_secs)
                .unwrap_or(300),
        )
    }

    /// Resolve the session storage directory.
    pub fn session_dir(&self) -> PathBuf {
        self.session
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| data_dir().join("sessions"))
    }

    pub fn sessions_in_memory(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.in_memory)
    }

    /// Get a config value by dotted path (e.g. "synthesis.max_concurrency").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.endpoints().is_empty() {
            warnings.push("No generation endpoints configured".to_string());
        }
        for p in self.endpoints() {
            if p.resolve_api_key().is_none() && p.base_url.is_none() {
                warnings.push(format!("Provider '{}' has no API key configured", p.id));
            }
        }

        match &self.tts {
            Some(tts) if tts.resolve_api_key().is_none() => {
                warnings.push("TTS provider has no API key configured".to_string());
            }
            None => warnings.push("No TTS provider configured; turns will be text-only".into()),
            _ => {}
        }

        let validation = self.validation();
        if !(0.0..=1.0).contains(&validation.threshold) {
            errors.push(format!(
                "validation.threshold must be within [0, 1], got {}",
                validation.threshold
            ));
        }
        if validation.max_attempts == 0 {
            errors.push("validation.max_attempts must be at least 1".to_string());
        }

        let synthesis = self.synthesis();
        if synthesis.max_concurrency == 0 {
            errors.push("synthesis.max_concurrency must be at least 1".to_string());
        }
        if synthesis.failure_threshold == 0 {
            errors.push("synthesis.failure_threshold must be at least 1".to_string());
        }

        if self.extractor().max_chars < 20 {
            errors.push("extractor.max_chars is too small (minimum 20)".to_string());
        }

        if self.routing.is_none() {
            warnings.push(
                "No routing section; using responders 'general' and 'assessment'".to_string(),
            );
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for tutorflow data: `~/.tutorflow/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tutorflow")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("TEST_TF_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_TF_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_TF_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_TF_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 18790);
        assert_eq!(config.synthesis().max_concurrency, 6);
        assert_eq!(config.synthesis().failure_threshold, 3);
        assert_eq!(config.validation().timeout_ms, 10_000);
        assert_eq!(config.validation().max_attempts, 2);
        assert_eq!(config.validation().threshold, 0.80);
        assert_eq!(config.extractor().max_chars, 500);
        assert_eq!(config.history_limit(), 6);
    }

    #[test]
    fn test_parse_json5_sections() {
        let raw = r#"{
            // comments are allowed
            routing: { default_responder: "tutor", assessment_responder: "quiz", policy: "keyword" },
            synthesis: { max_concurrency: 2 },
            providers: { tiers: { fast: "small-model" } },
        }"#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.default_responder(), "tutor");
        assert_eq!(config.assessment_responder(), "quiz");
        assert_eq!(config.policy_kind(), PolicyKind::Keyword);
        assert_eq!(config.synthesis().max_concurrency, 2);
        assert_eq!(config.synthesis().failure_threshold, 3);
        assert_eq!(config.model_for_tier(QualityTier::Fast), "small-model");
        assert_eq!(config.model_for_tier(QualityTier::Premium), "gpt-4o");
        assert_eq!(config.routing_model(), "small-model");
    }

    #[test]
    fn test_extractor_ceiling_follows_tts() {
        let raw = r#"{ tts: { max_chars: 300 } }"#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.extractor().max_chars, 300);
    }

    #[test]
    fn test_provider_resolve_api_key() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("TEST_TF_API_KEY", "from-env") };
        let provider = ProviderConfig {
            id: "test".into(),
            api_key_env: Some("TEST_TF_API_KEY".into()),
            api_key: None,
            base_url: None,
        };
        assert_eq!(provider.resolve_api_key(), Some("from-env".into()));

        let provider2 = ProviderConfig {
            id: "test".into(),
            api_key_env: Some("TEST_TF_API_KEY".into()),
            api_key: Some("direct-key".into()),
            base_url: None,
        };
        // Direct key takes priority
        assert_eq!(provider2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_TF_API_KEY") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = Config {
            validation: Some(ValidationConfig {
                threshold: 1.5,
                ..ValidationConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("threshold")),
            "Expected a threshold error, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config {
            providers: Some(ProvidersConfig {
                endpoints: vec![ProviderConfig {
                    id: "openai".into(),
                    api_key: None,
                    api_key_env: None,
                    base_url: None,
                }],
                ..ProvidersConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, _errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("openai")));
    }

    #[test]
    fn test_get_path() {
        let config = Config::parse(r#"{ synthesis: { max_concurrency: 4 } }"#).unwrap();
        assert_eq!(
            config.get_path("synthesis.max_concurrency"),
            Some(serde_json::json!(4))
        );
        assert!(config.get_path("nope.nothing").is_none());
    }
}
