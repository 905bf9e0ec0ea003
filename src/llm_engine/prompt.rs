//! Prompt templates for the note actions

use serde::{Deserialize, Serialize};

/// Action the user asked the model to perform
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    FillIn,
    Summarize,
    Continue,
    Rephrase,
}

impl PromptKind {
    pub fn template(&self) -> &'static str {
        match self {
            PromptKind::FillIn => {
                "Write the passage that belongs between the two passages below. Keep the author's style and reply with the missing passage only.\n\nBefore the gap:\n{0}\n\nAfter the gap:\n{1}"
            }
            PromptKind::Summarize => {
                "Summarize the following note in a few sentences. Reply with the summary only.\n\n{0}"
            }
            PromptKind::Continue => {
                "Continue writing the following note. Reply with the continuation only.\n\n{0}"
            }
            PromptKind::Rephrase => {
                "Rephrase the following text so it reads clearly. Reply with the rephrased text only.\n\n{0}"
            }
        }
    }
}

/// Interpolate `parts` into the template for `kind`.
///
/// `{n}` is replaced by the n-th part; placeholders without a part become
/// empty, parts without a placeholder are appended on their own lines.
pub fn compose_prompt(kind: PromptKind, parts: &[String]) -> String {
    let template = kind.template();
    let mut out = String::with_capacity(template.len() + parts.iter().map(|p| p.len()).sum::<usize>());
    let mut used = vec![false; parts.len()];
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}');
        let index = close.and_then(|c| after[..c].parse::<usize>().ok());

        match (close, index) {
            (Some(close), Some(index)) => {
                if let Some(part) = parts.get(index) {
                    out.push_str(part);
                    used[index] = true;
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    for (part, used) in parts.iter().zip(used) {
        if !used {
            out.push('\n');
            out.push_str(part);
        }
    }

    out
}
