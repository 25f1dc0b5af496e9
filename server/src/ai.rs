//! AI provider capability (Design Notes §9). Modeled as a single operation
//! plus an optional health check, not a class hierarchy — provider identity
//! is data (a tagged variant with its own config fields), not a subtype.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ApiResult, AppError};

/// Hosted providers get the shorter timeout; local models (Ollama) are
/// allowed to run longer before a completion is considered unavailable.
const HOSTED_TIMEOUT: Duration = Duration::from_secs(60);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub(crate) enum AiProviderConfig {
    Ollama { base_url: String, model: String },
    OpenAi { api_key: String, model: String },
    Anthropic { api_key: String, model: String },
    Google { api_key: String, model: String },
    OpenAiCompatible {
        base_url: String,
        api_key: Option<String>,
        model: String,
    },
}

impl AiProviderConfig {
    fn timeout(&self) -> Duration {
        match self {
            AiProviderConfig::Ollama { .. } => LOCAL_TIMEOUT,
            _ => HOSTED_TIMEOUT,
        }
    }
}

/// A text-completion capability. Provider variants are constructor-selected
/// values, not subclasses — the factory (`AiProviderConfig::into_completer`)
/// is the only place that knows how to reach a given backend.
pub(crate) trait Completer: Send + Sync {
    fn complete(&self, prompt: &str) -> futures_util::future::BoxFuture<'_, ApiResult<String>>;

    fn health_check(&self) -> futures_util::future::BoxFuture<'_, bool> {
        Box::pin(async { true })
    }
}

struct HttpCompleter {
    config: AiProviderConfig,
}

impl Completer for HttpCompleter {
    fn complete(&self, prompt: &str) -> futures_util::future::BoxFuture<'_, ApiResult<String>> {
        let prompt = prompt.to_string();
        Box::pin(async move {
            let timeout = self.config.timeout();
            tokio::time::timeout(timeout, dispatch(&self.config, &prompt))
                .await
                .map_err(|_| AppError::service_unavailable("AI completion timed out"))?
        })
    }
}

/// Placeholder wire call: out-of-scope external collaborator per §1, not a
/// live network client. Real providers would build a request here keyed on
/// the variant's fields.
async fn dispatch(_config: &AiProviderConfig, _prompt: &str) -> ApiResult<String> {
    Err(AppError::service_unavailable(
        "no AI provider is configured for this deployment",
    ))
}

pub(crate) fn build_completer(config: AiProviderConfig) -> Box<dyn Completer> {
    Box::new(HttpCompleter { config })
}
