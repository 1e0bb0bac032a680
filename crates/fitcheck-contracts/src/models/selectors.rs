use super::registry::ModelRegistry;
use crate::tryon::EndpointContract;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub contract: EndpointContract,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(&self, requested: Option<&str>) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(contract) = self.registry.get(requested_value) {
                return Ok(ModelSelection {
                    contract: contract.clone(),
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' is not in the try-on catalog."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let Some(contract) = self.registry.list().next().cloned() else {
            return Err("No try-on models available.".to_string());
        };
        Ok(ModelSelection {
            contract,
            requested: requested_text,
            fallback_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_returns_requested_model_without_fallback() {
        let selector = ModelSelector::new(None);
        let selection = selector.select(Some("try-on-diffusion")).unwrap();
        assert_eq!(selection.contract.name, "try-on-diffusion");
        assert_eq!(selection.requested.as_deref(), Some("try-on-diffusion"));
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn select_falls_back_to_default_with_reason() {
        let selector = ModelSelector::new(None);
        let selection = selector.select(Some("no-such-model")).unwrap();
        assert_eq!(selection.contract.name, "idm-vton");
        assert!(selection
            .fallback_reason
            .as_deref()
            .unwrap_or_default()
            .contains("no-such-model"));
    }

    #[test]
    fn select_without_request_uses_default() {
        let selector = ModelSelector::new(None);
        let selection = selector.select(None).unwrap();
        assert_eq!(selection.contract.name, "idm-vton");
        assert!(selection.requested.is_none());
        assert!(selection.fallback_reason.is_some());
    }
}
