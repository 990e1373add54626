use minijinja::{context, Environment};

use crate::knowledge::KnowledgeDoc;
use crate::types::{ChatMessage, CONTACT_FORM_MARKER, RATING_PROMPT_MARKER, ROLE_ASSISTANT, ROLE_USER};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub language: &'a str,
    pub knowledge_block: &'a str,
    pub docs_block: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            language => ctx.language,
            knowledge_block => ctx.knowledge_block,
            docs_block => ctx.docs_block,
            has_docs => !ctx.docs_block.trim().is_empty(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are \"AI Web Impuls\", the assistant of the WebImpuls development studio.\n\
         Respond in {}. Answer strictly from the studio information below and never invent facts.\n\
         \nStudio information:\n{}\n",
        ctx.language, ctx.knowledge_block
    );
    if !ctx.docs_block.trim().is_empty() {
        prompt.push_str("\nAdditional notes:\n");
        prompt.push_str(ctx.docs_block.trim());
        prompt.push('\n');
    }
    prompt
}

pub fn render_docs_block(docs: &[KnowledgeDoc]) -> String {
    docs.iter()
        .map(|doc| format!("- {}: {}", doc.title, doc.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Conversation turns as the model sees them: sentinel markers are a widget
/// convention and never reach the prompt.
pub fn prompt_history(messages: &[ChatMessage]) -> Vec<(String, String)> {
    messages
        .iter()
        .filter(|m| m.content != CONTACT_FORM_MARKER && m.content != RATING_PROMPT_MARKER)
        .filter(|m| m.role == ROLE_USER || m.role == ROLE_ASSISTANT)
        .map(|m| (m.role.clone(), m.content.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            id: "m".to_string(),
            chat_id: "c".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: "2026-02-01T09:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn system_prompt_pins_language_and_knowledge() {
        let ctx = SystemPromptContext {
            language: "Ukrainian",
            knowledge_block: "Studio: test\nServices:\n- Лендінг: price $800 - $1,500",
            docs_block: "",
        };
        let prompt = render_system_prompt(&ctx);
        assert!(prompt.contains("Respond in Ukrainian"));
        assert!(prompt.contains("$800 - $1,500"));
        assert!(!prompt.contains("Additional notes"));
    }

    #[test]
    fn docs_block_appears_only_when_present() {
        let docs = vec![KnowledgeDoc {
            title: "Hosting".to_string(),
            content: "We deploy to Vercel.".to_string(),
        }];
        let block = render_docs_block(&docs);
        let ctx = SystemPromptContext {
            language: "English",
            knowledge_block: "Studio: test",
            docs_block: &block,
        };
        let prompt = render_system_prompt(&ctx);
        assert!(prompt.contains("Additional notes"));
        assert!(prompt.contains("Hosting: We deploy to Vercel."));
    }

    #[test]
    fn history_drops_markers_and_foreign_roles() {
        let messages = vec![
            msg(ROLE_ASSISTANT, "Привіт!"),
            msg(ROLE_ASSISTANT, CONTACT_FORM_MARKER),
            msg(ROLE_USER, "Скільки коштує лендінг?"),
            msg(ROLE_ASSISTANT, RATING_PROMPT_MARKER),
            msg("system", "internal"),
        ];
        let history = prompt_history(&messages);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].0, ROLE_ASSISTANT);
        assert_eq!(history[1].1, "Скільки коштує лендінг?");
    }
}
