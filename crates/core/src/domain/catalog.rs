use std::collections::HashMap;

use crate::config::{AppConfig, ModelConfig};
use crate::errors::SessionError;

/// What a model alias resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    pub alias: String,
    pub name: String,
    pub provider: String,
    pub stream: bool,
    pub accepts_system_role: bool,
    pub accepts_temperature: bool,
}

impl From<&ModelConfig> for ModelSpec {
    fn from(model: &ModelConfig) -> Self {
        Self {
            alias: model.alias.clone(),
            name: model.name.clone(),
            provider: model.provider.clone(),
            stream: model.stream,
            accepts_system_role: model.system_prompt,
            accepts_temperature: model.temperature,
        }
    }
}

/// Model aliases and system prompts known to the process. Built once at
/// startup and never reloaded.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    models: Vec<ModelSpec>,
    model_index: HashMap<String, usize>,
    prompts: Vec<(String, String)>,
}

impl Catalog {
    pub fn new(models: Vec<ModelSpec>, prompts: Vec<(String, String)>) -> Self {
        let model_index =
            models.iter().enumerate().map(|(index, model)| (model.alias.clone(), index)).collect();
        Self { models, model_index, prompts }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.models.iter().map(ModelSpec::from).collect(),
            config
                .prompts
                .iter()
                .map(|prompt| (prompt.name.clone(), prompt.content.clone()))
                .collect(),
        )
    }

    pub fn model(&self, alias: &str) -> Option<&ModelSpec> {
        self.model_index.get(alias).map(|index| &self.models[*index])
    }

    pub fn resolve_model(&self, alias: &str) -> Result<&ModelSpec, SessionError> {
        self.model(alias).ok_or_else(|| SessionError::ModelUnavailable { alias: alias.to_string() })
    }

    /// Aliases in declaration order.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|model| model.alias.as_str())
    }

    pub fn prompt(&self, name: &str) -> Option<&str> {
        self.prompts
            .iter()
            .find(|(prompt_name, _)| prompt_name == name)
            .map(|(_, content)| content.as_str())
    }

    pub fn prompt_names(&self) -> impl Iterator<Item = &str> {
        self.prompts.iter().map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Catalog, ModelSpec};
    use crate::errors::SessionError;

    fn spec(alias: &str, stream: bool) -> ModelSpec {
        ModelSpec {
            alias: alias.to_string(),
            name: format!("{alias}-upstream"),
            provider: "openai".to_string(),
            stream,
            accepts_system_role: true,
            accepts_temperature: true,
        }
    }

    #[test]
    fn resolves_known_aliases_and_reports_unknown() {
        let catalog = Catalog::new(
            vec![spec("mini", true), spec("large", false)],
            vec![("default".to_string(), "be nice".to_string())],
        );

        assert_eq!(catalog.resolve_model("large").map(|model| model.stream), Ok(false));
        assert_eq!(
            catalog.resolve_model("ghost"),
            Err(SessionError::ModelUnavailable { alias: "ghost".to_string() })
        );
        assert_eq!(catalog.aliases().collect::<Vec<_>>(), vec!["mini", "large"]);
        assert_eq!(catalog.prompt("default"), Some("be nice"));
        assert_eq!(catalog.prompt("missing"), None);
    }
}
