use minijinja::{context, Environment};
use serde::Serialize;

const ANSWER_PROMPT_TEMPLATE: &str = include_str!("prompts/answer_prompt.j2");

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Esme, a careful assistant that answers questions about a team's shared documents.";

#[derive(Debug, Clone, Serialize)]
pub struct PromptDocument {
    pub name: String,
    pub kind: String,
    /// Extracted text, or a visible note explaining why it is missing.
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptTurn {
    pub role: String,
    pub text: String,
}

pub struct AnswerPromptContext<'a> {
    pub conversation_name: &'a str,
    pub system_prompt: Option<&'a str>,
    pub documents: &'a [PromptDocument],
    pub history: &'a [PromptTurn],
    pub question: &'a str,
}

impl AnswerPromptContext<'_> {
    fn system_prompt(&self) -> &str {
        self.system_prompt
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

pub fn render_answer_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("answer_prompt", ANSWER_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_answer_prompt(ctx);
    }

    let Ok(template) = env.get_template("answer_prompt") else {
        return fallback_answer_prompt(ctx);
    };

    template
        .render(context! {
            system_prompt => ctx.system_prompt(),
            conversation_name => ctx.conversation_name,
            documents => ctx.documents,
            history => ctx.history,
            question => ctx.question.trim(),
        })
        .unwrap_or_else(|_| fallback_answer_prompt(ctx))
}

fn fallback_answer_prompt(ctx: &AnswerPromptContext<'_>) -> String {
    let mut prompt = format!(
        "{}\n\nAnswer questions about the documents attached to \"{}\".\n",
        ctx.system_prompt(),
        ctx.conversation_name.trim()
    );

    for doc in ctx.documents {
        prompt.push_str(&format!("\n### {} ({})\n", doc.name, doc.kind));
        prompt.push_str(doc.body.trim());
        prompt.push('\n');
    }

    if !ctx.history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for turn in ctx.history {
            prompt.push_str(&format!("{}: {}\n", turn.role, turn.text));
        }
    }

    prompt.push_str("\nQuestion:\n");
    prompt.push_str(ctx.question.trim());
    prompt.push('\n');
    prompt
}
