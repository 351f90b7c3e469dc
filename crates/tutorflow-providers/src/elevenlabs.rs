//! ElevenLabs text-to-speech synthesis.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use tutorflow_core::config::TtsConfig;

use crate::SynthesisProvider;

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_VOICE: &str = "Rachel";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_OUTPUT_FORMAT: &str = "mp3_44100_128";

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    voice: String,
    model: String,
    output_format: String,
    max_chars: usize,
}

impl ElevenLabsSynthesizer {
    pub fn from_config(config: &TtsConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(ELEVENLABS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            voice: config
                .default_voice
                .clone()
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            output_format: config
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string()),
            max_chars: config.max_chars,
        })
    }
}

/// Build the ElevenLabs streaming TTS request URL for a given voice.
pub fn build_tts_url(base_url: &str, voice: &str, output_format: &str) -> String {
    format!("{base_url}/v1/text-to-speech/{voice}/stream?output_format={output_format}")
}

/// Codec label from an ElevenLabs output format (e.g. "mp3_44100_128" -> "mp3").
pub fn format_label(output_format: &str) -> &str {
    output_format.split('_').next().unwrap_or(output_format)
}

#[async_trait]
impl SynthesisProvider for ElevenLabsSynthesizer {
    fn max_chars(&self) -> usize {
        self.max_chars
    }

    fn format(&self) -> &str {
        format_label(&self.output_format)
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let chars = text.chars().count();
        if chars > self.max_chars {
            anyhow::bail!(
                "TTS input of {chars} chars exceeds the {} char ceiling",
                self.max_chars
            );
        }

        debug!(voice = %self.voice, model = %self.model, text_len = chars, "Synthesizing");

        let resp = self
            .client
            .post(build_tts_url(&self.base_url, &self.voice, &self.output_format))
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let mut audio = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}"))?;
            audio.extend_from_slice(&bytes);
        }
        if audio.is_empty() {
            anyhow::bail!("TTS API returned no audio");
        }
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TtsConfig {
        TtsConfig {
            provider: "elevenlabs".into(),
            api_key: Some("k".into()),
            api_key_env: None,
            base_url: Some("http://localhost:9/".into()),
            default_voice: None,
            default_model: None,
            output_format: None,
            max_chars: 40,
        }
    }

    #[test]
    fn test_request_construction() {
        let url = build_tts_url(ELEVENLABS_BASE_URL, "Rachel", "mp3_44100_128");
        assert!(url.starts_with("https://api.elevenlabs.io/v1/text-to-speech/Rachel/stream"));
        assert!(url.ends_with("output_format=mp3_44100_128"));
        assert_eq!(format_label("pcm_16000"), "pcm");
    }

    #[test]
    fn test_from_config_defaults() {
        let synth = ElevenLabsSynthesizer::from_config(&config()).unwrap();
        assert_eq!(synth.base_url, "http://localhost:9");
        assert_eq!(synth.voice, DEFAULT_VOICE);
        assert_eq!(synth.format(), "mp3");
        assert_eq!(synth.max_chars(), 40);
    }

    #[test]
    fn test_missing_key_is_error() {
        let mut cfg = config();
        cfg.api_key = None;
        assert!(ElevenLabsSynthesizer::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_rejects_text_over_ceiling() {
        let synth = ElevenLabsSynthesizer::from_config(&config()).unwrap();
        let err = synth.synthesize(&"a".repeat(41)).await.unwrap_err();
        assert!(err.to_string().contains("ceiling"));
    }
}
