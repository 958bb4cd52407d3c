use super::registry::{BackendId, BackendRegistry, BackendSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSelection {
    pub spec: BackendSpec,
    pub requested: Option<String>,
    pub defaulted: bool,
}

#[derive(Debug, Clone)]
pub struct BackendSelector {
    pub registry: BackendRegistry,
    default_backend: BackendId,
}

impl BackendSelector {
    pub fn new(registry: Option<BackendRegistry>, default_backend: BackendId) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| BackendRegistry::new(None)),
            default_backend,
        }
    }

    /// Unknown selectors are an error rather than a silent fallback: a
    /// misconfigured model must fail before any paid work starts.
    pub fn select(&self, requested: Option<&str>) -> Result<BackendSelection, String> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty());

        if let Some(requested_value) = requested {
            let Some(spec) = self.registry.resolve(requested_value) else {
                return Err(format!(
                    "Unsupported model '{requested_value}' (available: [{}]).",
                    self.registry.names().join(", ")
                ));
            };
            return Ok(BackendSelection {
                spec: spec.clone(),
                requested: Some(requested_value.to_string()),
                defaulted: false,
            });
        }

        let Some(spec) = self.registry.get(self.default_backend) else {
            return Err(format!(
                "Default backend '{}' is not registered.",
                self.default_backend
            ));
        };
        Ok(BackendSelection {
            spec: spec.clone(),
            requested: None,
            defaulted: true,
        })
    }
}
