use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use llama_cpp::{standard_sampler::StandardSampler, LlamaModel, LlamaParams, SessionParams};
use parking_lot::RwLock;
use tracing::{info, warn};

use super::engine::{trim_completion, InferenceEngine, PromptTemplate, DEFAULT_MAX_TOKENS};

const MAX_GENERATED_CHARS: usize = 4096;

/// In-process GGUF engine. Each `infer` call opens its own session on the
/// shared model, so concurrent calls do not share a context.
pub struct LlamaEngine {
    model: RwLock<Option<Arc<LlamaModel>>>,
    template: PromptTemplate,
    max_tokens: usize,
}

impl LlamaEngine {
    pub fn new(template: PromptTemplate, max_tokens: usize) -> Self {
        Self {
            model: RwLock::new(None),
            template,
            max_tokens,
        }
    }

    fn generate(&self, model: &LlamaModel, prompt: &str) -> Result<String> {
        let mut session = model
            .create_session(SessionParams::default())
            .map_err(|err| anyhow!("failed to create llama session: {err:?}"))?;

        session
            .advance_context(self.template.render(prompt))
            .map_err(|err| anyhow!("failed to advance llama context: {err}"))?;

        let mut stream = session
            .start_completing_with(StandardSampler::default(), self.max_tokens)
            .map_err(|err| anyhow!("failed to start llama completion: {err:?}"))?
            .into_strings();

        let mut output = String::new();
        while let Some(chunk) = stream.next() {
            output.push_str(&chunk);
            if output.contains("\nUser:") || output.len() >= MAX_GENERATED_CHARS {
                break;
            }
        }
        drop(stream);

        Ok(trim_completion(&output))
    }
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new(PromptTemplate::default(), DEFAULT_MAX_TOKENS)
    }
}

impl InferenceEngine for LlamaEngine {
    fn load(&self, path: &Path) -> bool {
        match LlamaModel::load_from_file(path, LlamaParams::default()) {
            Ok(model) => {
                info!("llama model loaded from {:?}", path);
                *self.model.write() = Some(Arc::new(model));
                true
            }
            Err(err) => {
                warn!("failed to load llama model {:?}: {err:?}", path);
                false
            }
        }
    }

    fn infer(&self, prompt: &str) -> String {
        let Some(model) = self.model.read().clone() else {
            return String::new();
        };
        self.generate(&model, prompt).unwrap_or_else(|error| {
            warn!("llama generation failed: {error:?}");
            String::new()
        })
    }

    fn unload(&self) {
        if self.model.write().take().is_some() {
            info!("llama model released");
        }
    }
}
