use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::chat::ChatMessage;

static AGENT_NAME: OnceLock<Regex> = OnceLock::new();

pub struct TemplateEngine;

impl TemplateEngine {
    // Templates embedded at compile time
    const SYSTEM_PROMPT: &'static str = include_str!("../templates/system_prompt.txt");
    const MEMORY_PROMPT: &'static str = include_str!("../templates/memory_prompt.txt");

    #[must_use]
    pub fn render(
        template: &str,
        variables: &HashMap<&str, &str>,
    ) -> String {
        let mut result = template.to_string();

        for (key, value) in variables {
            let placeholder = format!("{{{{{key}}}}}");
            result = result.replace(&placeholder, value);
        }

        result
    }

    /// Persona name safe to splice into a prompt, or `None`
    #[must_use]
    pub fn sanitize_agent(agent: &str) -> Option<&str> {
        let pattern = AGENT_NAME.get_or_init(|| Regex::new(r"^[\p{L}\p{N} _\-]{1,40}$").expect("valid agent pattern"));
        let agent = agent.trim();
        pattern.is_match(agent).then_some(agent)
    }

    /// Render the persona system prompt, falling back to `default_agent`.
    #[must_use]
    pub fn render_system_prompt(
        agent: Option<&str>,
        default_agent: &str,
    ) -> String {
        let agent = agent.and_then(Self::sanitize_agent).unwrap_or(default_agent);

        let mut variables = HashMap::new();
        variables.insert("AGENT", agent);

        Self::render(Self::SYSTEM_PROMPT, &variables).trim_end().to_string()
    }

    /// Render recalled memories as a bullet list, or nothing when there are none.
    #[must_use]
    pub fn render_memory_prompt(memories: &[String]) -> Option<String> {
        if memories.is_empty() {
            return None;
        }

        let bullets = memories
            .iter()
            .map(|m| format!("- {}", m.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        let mut variables = HashMap::new();
        variables.insert("MEMORIES", bullets.as_str());

        Some(Self::render(Self::MEMORY_PROMPT, &variables).trim_end().to_string())
    }

    /// Full message list sent upstream for one companion turn
    #[must_use]
    pub fn build_messages(
        message: &str,
        agent: Option<&str>,
        default_agent: &str,
        memories: &[String],
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(Self::render_system_prompt(agent, default_agent))];
        if let Some(memory_prompt) = Self::render_memory_prompt(memories) {
            messages.push(ChatMessage::system(memory_prompt));
        }
        messages.push(ChatMessage::user(message.trim()));
        messages
    }
}
