mod command;
mod engine;
#[cfg(feature = "llama")]
mod llama;

pub use command::CommandEngine;
pub use engine::{
    trim_completion, InferenceEngine, PromptTemplate, DEFAULT_MAX_TOKENS, DEFAULT_SYSTEM_PROMPT,
};
#[cfg(feature = "llama")]
pub use llama::LlamaEngine;
