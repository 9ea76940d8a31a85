use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use super::engine::{trim_completion, InferenceEngine, PromptTemplate, DEFAULT_MAX_TOKENS};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const ENV_CMD: &str = "OFFLINE_AI_ENGINE_CMD";
const ENV_ARGS: &str = "OFFLINE_AI_ENGINE_ARGS";
const ENV_TIMEOUT: &str = "OFFLINE_AI_ENGINE_TIMEOUT_SECS";
const MODEL_PLACEHOLDER: &str = "{model}";
const TOKENS_PLACEHOLDER: &str = "{max_tokens}";

/// Runs an external generation binary (for example `llama-cli`) once per
/// prompt. The rendered prompt goes to stdin and the completion is read from
/// stdout. `{model}` and `{max_tokens}` in the arguments are substituted.
pub struct CommandEngine {
    path: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    template: PromptTemplate,
    max_tokens: usize,
    model: RwLock<Option<PathBuf>>,
}

impl CommandEngine {
    pub fn new(path: PathBuf, args: Vec<String>, timeout: Duration) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("engine command points to missing binary: {:?}", path));
        }
        Ok(Self {
            path,
            args,
            timeout,
            template: PromptTemplate::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
            model: RwLock::new(None),
        })
    }

    pub fn from_env() -> Result<Self> {
        let cmd = std::env::var(ENV_CMD).with_context(|| format!("{ENV_CMD} not set"))?;

        let args = std::env::var(ENV_ARGS)
            .map(|value| value.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        let timeout = std::env::var(ENV_TIMEOUT)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::new(PathBuf::from(cmd), args, timeout)
    }

    #[must_use]
    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn expanded_args(&self, model: &Path) -> Vec<String> {
        let model = model.to_string_lossy();
        let tokens = self.max_tokens.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(MODEL_PLACEHOLDER, &model)
                    .replace(TOKENS_PLACEHOLDER, &tokens)
            })
            .collect()
    }

    fn run(&self, model: &Path, input: &str) -> Result<String> {
        let mut child = Command::new(&self.path)
            .args(self.expanded_args(model))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn engine command {:?}", self.path))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .context("failed to write prompt to engine stdin")?;
        }

        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait().context("failed polling engine command")? {
                if !status.success() {
                    let mut stderr = Vec::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        let _ = pipe.read_to_end(&mut stderr);
                    }
                    return Err(anyhow!(
                        "engine command exited with status {:?}: {}",
                        status.code(),
                        String::from_utf8_lossy(&stderr)
                    ));
                }
                let mut stdout = child
                    .stdout
                    .take()
                    .context("stdout handle unavailable after process exit")?;
                let mut buf = Vec::new();
                stdout
                    .read_to_end(&mut buf)
                    .context("failed reading engine stdout")?;
                let text = String::from_utf8(buf).context("engine returned non-UTF8 text")?;
                return Ok(trim_completion(&text));
            }

            if start.elapsed() > self.timeout {
                let _ = child.kill();
                return Err(anyhow!("engine command exceeded {:?} timeout", self.timeout));
            }

            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl InferenceEngine for CommandEngine {
    fn load(&self, path: &Path) -> bool {
        if !path.is_file() {
            warn!("model file {:?} is missing", path);
            return false;
        }
        info!("command engine bound to model {:?}", path);
        *self.model.write() = Some(path.to_path_buf());
        true
    }

    fn infer(&self, prompt: &str) -> String {
        let Some(model) = self.model.read().clone() else {
            return String::new();
        };
        let rendered = self.template.render(prompt);
        match self.run(&model, &rendered) {
            Ok(text) => text,
            Err(error) => {
                warn!("engine command failed: {error:?}");
                String::new()
            }
        }
    }

    fn unload(&self) {
        self.model.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn command_engine_accepts_existing_binary() {
        let engine = CommandEngine::new(PathBuf::from("/bin/sh"), Vec::new(), DEFAULT_TIMEOUT);
        assert!(engine.is_ok());
    }

    #[test]
    fn command_engine_missing_binary_errors() {
        let engine = CommandEngine::new(
            PathBuf::from("/definitely/missing/binary"),
            Vec::new(),
            DEFAULT_TIMEOUT,
        );
        assert!(engine.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn infers_through_the_command_once_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"weights").unwrap();

        // `cat` echoes the rendered prompt back
        let engine = CommandEngine::new(PathBuf::from("/bin/cat"), Vec::new(), DEFAULT_TIMEOUT)
            .unwrap()
            .with_template(PromptTemplate::new(""));

        assert_eq!(engine.infer("hi"), "");
        assert!(engine.load(&model));
        assert_eq!(engine.infer("hi"), "User: hi\nAssistant:");

        engine.unload();
        assert_eq!(engine.infer("hi"), "");
    }

    #[cfg(unix)]
    #[test]
    fn load_rejects_missing_model() {
        let engine =
            CommandEngine::new(PathBuf::from("/bin/cat"), Vec::new(), DEFAULT_TIMEOUT).unwrap();
        assert!(!engine.load(Path::new("/definitely/missing/model.gguf")));
    }

    #[test]
    fn placeholders_are_substituted() {
        let engine = CommandEngine {
            path: PathBuf::from("llama-cli"),
            args: vec!["-m".into(), "{model}".into(), "-n".into(), "{max_tokens}".into()],
            timeout: DEFAULT_TIMEOUT,
            template: PromptTemplate::default(),
            max_tokens: 64,
            model: RwLock::new(None),
        };
        assert_eq!(
            engine.expanded_args(Path::new("/m/x.gguf")),
            vec!["-m", "/m/x.gguf", "-n", "64"]
        );
    }
}
