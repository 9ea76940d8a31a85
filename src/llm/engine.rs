use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a health assistant. You give general advice only. You never diagnose. You always recommend consulting a doctor.";
pub const DEFAULT_MAX_TOKENS: usize = 200;

/// The native generation capability behind the model slot.
///
/// Calls are synchronous and may block for a long time. Failure is signalled
/// the way native bindings usually do it: `load` returns `false` and `infer`
/// returns an empty string. Implementations must tolerate `infer` being
/// called from several threads and `unload` being called more than once.
pub trait InferenceEngine: Send + Sync {
    fn load(&self, path: &Path) -> bool;
    fn infer(&self, prompt: &str) -> String;
    fn unload(&self);
}

/// Wraps a user prompt in the conversation framing the local model expects.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    system: String,
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    #[must_use]
    pub fn render(&self, prompt: &str) -> String {
        if self.system.trim().is_empty() {
            return format!("User: {prompt}\nAssistant:");
        }
        format!("{}\n\nUser: {prompt}\nAssistant:", self.system)
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

/// Cuts a completion at the point the model starts a new user turn.
#[must_use]
pub fn trim_completion(raw: &str) -> String {
    raw.split("\nUser:")
        .next()
        .unwrap_or(raw)
        .trim()
        .to_string()
}
