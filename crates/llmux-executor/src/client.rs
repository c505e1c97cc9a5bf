use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use llmux_core::{Auth, ExecutorError, ExecutorResult};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, wreq::Client>>> = OnceLock::new();

/// Resolves the outbound proxy for a credential: credential attribute, then
/// credential-level proxy URL, then the global config.
pub fn resolve_proxy(cfg: &Config, auth: &Auth) -> Option<String> {
    auth.attribute("proxy_url")
        .map(str::to_string)
        .or_else(|| normalize(auth.proxy_url.clone()))
        .or_else(|| normalize(cfg.proxy_url.clone()))
}

/// Returns a shared HTTP client honoring the credential's proxy. Clients are
/// cached per proxy so connection pools are reused across requests.
pub fn client_for(cfg: &Config, auth: &Auth) -> ExecutorResult<wreq::Client> {
    let key = ClientKey {
        proxy: resolve_proxy(cfg, auth),
    };

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| ExecutorError::internal("http client cache lock failed"))?;

    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let client = build_client(key.proxy.as_deref())?;
    guard.insert(key, client.clone());
    Ok(client)
}

fn build_client(proxy: Option<&str>) -> ExecutorResult<wreq::Client> {
    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url)
                .map_err(|err| ExecutorError::internal(format!("invalid proxy: {err}")))?,
        );
    }
    builder
        .build()
        .map_err(|err| ExecutorError::internal(format!("http client build failed: {err}")))
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_resolution_order() {
        let mut cfg = Config::default();
        cfg.proxy_url = Some("http://global:8080".to_string());

        let mut auth = Auth::new("a", "codex");
        assert_eq!(resolve_proxy(&cfg, &auth).as_deref(), Some("http://global:8080"));

        auth.proxy_url = Some("socks5://cred:1080".to_string());
        assert_eq!(resolve_proxy(&cfg, &auth).as_deref(), Some("socks5://cred:1080"));

        auth.attributes
            .insert("proxy_url".to_string(), "http://attr:3128".to_string());
        assert_eq!(resolve_proxy(&cfg, &auth).as_deref(), Some("http://attr:3128"));
    }

    #[test]
    fn blank_proxies_are_ignored() {
        let mut cfg = Config::default();
        cfg.proxy_url = Some("   ".to_string());
        let auth = Auth::new("a", "codex");
        assert_eq!(resolve_proxy(&cfg, &auth), None);
    }
}
