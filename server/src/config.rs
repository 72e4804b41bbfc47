use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use platform_authn::RestConfig;
use platform_authz::RouteAccessPolicy;
use platform_guard::ResolverOptions;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend: Arc<RestConfig>,
    pub policy: Arc<RouteAccessPolicy>,
    pub resolver: ResolverOptions,
    pub cors_allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = required(&lookup, "BACKEND_URL")?;
        let api_key = required(&lookup, "BACKEND_API_KEY")?;
        let backend = RestConfig::new(&base_url, api_key).context("invalid BACKEND_URL")?;

        let mut resolver = ResolverOptions::default();
        if let Some(raw) = lookup("GUARD_FETCH_TIMEOUT_MS") {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid GUARD_FETCH_TIMEOUT_MS {raw:?}"))?;
            if millis == 0 {
                return Err(anyhow!("GUARD_FETCH_TIMEOUT_MS must be positive"));
            }
            resolver.fetch_timeout = Duration::from_millis(millis);
        }

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            backend: Arc::new(backend),
            policy: Arc::new(load_policy(&lookup)?),
            resolver,
            cors_allowed_origins,
        })
    }
}

/// Built-in farm table unless `GUARD_POLICY_FILE` points at a JSON document.
pub fn load_policy(lookup: impl Fn(&str) -> Option<String>) -> Result<RouteAccessPolicy> {
    let Some(path) = lookup("GUARD_POLICY_FILE").filter(|p| !p.trim().is_empty()) else {
        return Ok(RouteAccessPolicy::farm_default());
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read policy file {path}"))?;
    RouteAccessPolicy::from_json(&raw).with_context(|| format!("invalid policy file {path}"))
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("missing env {}", key))
}
