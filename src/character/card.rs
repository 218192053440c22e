use serde::{Deserialize, Serialize};

/// Template used when a character asks for one without spelling it out.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are {character_name}. {personality}";

/// A chat persona. Each character owns one conversation tree whose root is
/// the rendered persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    /// Personality text, used verbatim as the persona unless a template is set.
    pub persona: String,
    /// First assistant message of a fresh conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    /// Preferred provider config id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Persona layout with `{character_name}` and `{personality}`
    /// placeholders. An empty template selects [`DEFAULT_SYSTEM_TEMPLATE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_template: Option<String>,
}

impl Character {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        persona: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            persona: persona.into(),
            greeting: None,
            provider: None,
            system_template: None,
        }
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_system_template(mut self, template: impl Into<String>) -> Self {
        self.system_template = Some(template.into());
        self
    }

    /// Text of the persona root message.
    pub fn system_prompt(&self, user_name: &str) -> String {
        let rendered = match self.system_template.as_deref() {
            None => self.persona.clone(),
            Some(template) => {
                let template = if template.trim().is_empty() {
                    DEFAULT_SYSTEM_TEMPLATE
                } else {
                    template
                };
                template
                    .replace("{character_name}", &self.name)
                    .replace("{personality}", &self.persona)
            }
        };
        self.substitute(&rendered, user_name)
    }

    /// Greeting with placeholders filled in, or `None` when there is nothing
    /// to say.
    pub fn greeting_for(&self, user_name: &str) -> Option<String> {
        self.greeting
            .as_deref()
            .filter(|greeting| !greeting.trim().is_empty())
            .map(|greeting| self.substitute(greeting, user_name))
    }

    fn substitute(&self, text: &str, user_name: &str) -> String {
        text.replace("{{char}}", &self.name)
            .replace("{{user}}", user_name)
    }
}
