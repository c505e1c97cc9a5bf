pub mod claude;
pub mod codex;
pub mod gemini;
pub mod gemini_cli;
pub mod iflow;
pub mod kimi;
pub mod openai_compat;
pub mod qwen;
pub mod vertex;

use std::sync::Arc;

use llmux_core::{
    Auth, ExecutorError, ExecutorResult, ExecutorRegistry, Headers, PreparedHttpRequest,
    PreparedHttpResponse, ProviderExecutor, Translator, UsageSink, header_set,
};

use crate::base::{BaseExecutor, ProviderConfig};
use crate::base::headers_from_wreq;
use crate::client::client_for;
use crate::config::Config;

pub(crate) fn set_bearer(headers: &mut Headers, token: &str) {
    if !token.trim().is_empty() {
        header_set(headers, "Authorization", &format!("Bearer {}", token.trim()));
    }
}

/// Executes a prepared pass-through request with the shared client stack.
pub(crate) async fn passthrough_http(
    cfg: &Config,
    auth: &Auth,
    req: PreparedHttpRequest,
) -> ExecutorResult<PreparedHttpResponse> {
    let client = client_for(cfg, auth)?;
    let method = wreq::Method::from_bytes(req.method.as_bytes())
        .map_err(|_| ExecutorError::invalid_request(format!("invalid method {:?}", req.method)))?;
    let mut builder = client.request(method, &req.url);
    for (key, value) in &req.headers {
        builder = builder.header(key, value);
    }
    if let Some(body) = req.body {
        builder = builder.body(body);
    }
    let resp = builder
        .send()
        .await
        .map_err(|err| ExecutorError::transport(err.to_string()))?;
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());
    let body = resp
        .bytes()
        .await
        .map_err(|err| ExecutorError::transport(err.to_string()))?;
    Ok(PreparedHttpResponse {
        status,
        headers,
        body,
    })
}

/// Token-count estimate serialized as OpenAI chat usage.
pub(crate) fn openai_usage_json(count: i64) -> Vec<u8> {
    format!(
        "{{\"usage\":{{\"prompt_tokens\":{count},\"completion_tokens\":0,\"total_tokens\":{count}}}}}"
    )
    .into_bytes()
}

/// Assembles the full executor fleet over shared config, translator, and
/// usage sink.
pub fn standard_registry(
    cfg: Arc<Config>,
    translator: Arc<dyn Translator>,
    sink: Arc<dyn UsageSink>,
) -> ExecutorRegistry {
    let base = |provider: Arc<dyn ProviderConfig>| {
        BaseExecutor::new(
            Arc::clone(&cfg),
            Arc::clone(&translator),
            Arc::clone(&sink),
            provider,
        )
    };

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(kimi::KimiExecutor::new(base(Arc::new(
        kimi::KimiProviderConfig,
    )))));
    registry.register(Arc::new(qwen::QwenExecutor::new(base(Arc::new(
        qwen::QwenProviderConfig,
    )))));
    registry.register(Arc::new(iflow::IFlowExecutor::new(base(Arc::new(
        iflow::IFlowProviderConfig,
    )))));
    registry.register(Arc::new(claude::ClaudeExecutor::new(base(Arc::new(
        claude::ClaudeProviderConfig,
    )))));
    registry.register(Arc::new(gemini::GeminiExecutor::new(base(Arc::new(
        gemini::GeminiProviderConfig,
    )))));
    registry.register(Arc::new(gemini_cli::GeminiCliExecutor::new(base(Arc::new(
        gemini_cli::GeminiCliProviderConfig,
    )))));
    registry.register(Arc::new(vertex::VertexExecutor::new(base(Arc::new(
        vertex::VertexProviderConfig,
    )))));
    registry.register(Arc::new(openai_compat::OpenAICompatExecutor::new(
        "openai-compat",
        base(Arc::new(openai_compat::OpenAICompatProviderConfig::new(
            "openai-compat",
        ))),
    )));

    let codex_http = Arc::new(codex::CodexExecutor::new(base(Arc::new(
        codex::CodexProviderConfig,
    ))));
    registry.register(Arc::new(codex::CodexAutoExecutor::new(codex_http)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_core::{MemoryUsageSink, PassthroughTranslator};

    #[test]
    fn standard_registry_covers_the_fleet() {
        let registry = standard_registry(
            Arc::new(Config::default()),
            Arc::new(PassthroughTranslator),
            Arc::new(MemoryUsageSink::new()),
        );
        for provider in [
            "kimi",
            "qwen",
            "iflow",
            "claude",
            "gemini",
            "gemini-cli",
            "gemini-vertex",
            "openai-compat",
            "codex",
        ] {
            assert!(registry.get(provider).is_some(), "missing {provider}");
        }
    }
}
