//! Build pipeline components from configuration.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use tutorflow_core::cache::InvalidationBus;
use tutorflow_core::config::{Config, PolicyKind, TierModels};
use tutorflow_core::registry::ResponderCatalog;
use tutorflow_core::session::{MemorySessionStore, SessionStore};
use tutorflow_core::session_store::JsonlSessionStore;
use tutorflow_core::types::QualityTier;
use tutorflow_providers::elevenlabs::ElevenLabsSynthesizer;
use tutorflow_providers::failover::FailoverProvider;
use tutorflow_providers::generator::LlmGenerator;
use tutorflow_providers::openai::OpenAiProvider;
use tutorflow_providers::validator::LlmValidator;
use tutorflow_providers::{Credentials, LlmProvider, SynthesisProvider, ValidationProvider};

use crate::policy::{KeywordPolicy, LlmSelectionPolicy, SelectionPolicy};
use crate::turn::PipelineComponents;

/// Chat-completions provider over every configured endpoint, in priority order.
pub fn llm_from_config(config: &Config) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let endpoints: Vec<(Arc<dyn LlmProvider>, Credentials)> = config
        .endpoints()
        .iter()
        .map(|ep| {
            let provider: Arc<dyn LlmProvider> =
                Arc::new(OpenAiProvider::from_config(&ep.id, ep.base_url.as_deref()));
            (provider, Credentials::from_key(ep.resolve_api_key()))
        })
        .collect();
    if endpoints.is_empty() {
        anyhow::bail!("No generation providers configured (providers.endpoints is empty)");
    }
    info!(endpoints = endpoints.len(), "Generation providers configured");
    Ok(Arc::new(FailoverProvider::new("generation".into(), endpoints)))
}

/// Speech synthesizer, or `None` for text-only delivery.
pub fn synthesizer_from_config(config: &Config) -> Option<Arc<dyn SynthesisProvider>> {
    let tts = config.tts.as_ref()?;
    match tts.provider.as_str() {
        "elevenlabs" => match ElevenLabsSynthesizer::from_config(tts) {
            Ok(synth) => Some(Arc::new(synth)),
            Err(e) => {
                warn!(error = %e, "Speech synthesis unavailable, delivering text only");
                None
            }
        },
        other => {
            warn!(provider = other, "Unknown TTS provider, delivering text only");
            None
        }
    }
}

/// Session store selected by `session.in_memory`.
pub fn store_from_config(config: &Config) -> Arc<dyn SessionStore> {
    if config.sessions_in_memory() {
        Arc::new(MemorySessionStore::new())
    } else {
        Arc::new(JsonlSessionStore::new(config.session_dir()))
    }
}

/// Every component the pipeline needs, wired from configuration.
pub fn components_from_config(
    config: &Config,
    bus: &InvalidationBus,
) -> anyhow::Result<PipelineComponents> {
    let llm = llm_from_config(config).context("building generation provider")?;

    let catalog = Arc::new(ResponderCatalog::from_dir(
        config.registry_dir(),
        config.registry_ttl(),
        bus,
    ));
    let registry = catalog.current();
    if registry.is_empty() {
        warn!(dir = %config.registry_dir().display(), "No responders found");
    } else {
        info!(responders = registry.len(), "Responders loaded");
    }

    let models = TierModels {
        fast: config.model_for_tier(QualityTier::Fast),
        standard: config.model_for_tier(QualityTier::Standard),
        premium: config.model_for_tier(QualityTier::Premium),
    };
    let generator = Arc::new(LlmGenerator::new(
        llm.clone(),
        Credentials::None,
        models,
        config.max_tokens(),
        config.temperature(),
    ));

    let policy: Arc<dyn SelectionPolicy> = match config.policy_kind() {
        PolicyKind::Llm => Arc::new(LlmSelectionPolicy::new(
            llm.clone(),
            Credentials::None,
            config.routing_model(),
        )),
        PolicyKind::Keyword => Arc::new(KeywordPolicy),
    };

    let validator: Option<Arc<dyn ValidationProvider>> = config.validation().enabled.then(|| {
        Arc::new(LlmValidator::new(
            llm.clone(),
            Credentials::None,
            config.validation_model(),
        )) as Arc<dyn ValidationProvider>
    });

    Ok(PipelineComponents {
        catalog,
        policy,
        generator,
        synthesizer: synthesizer_from_config(config),
        validator,
        store: store_from_config(config),
    })
}
