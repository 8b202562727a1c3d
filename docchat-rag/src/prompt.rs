//! Prompt templates with `{name}` placeholders.
//!
//! Two placeholders are understood: `{context}` (the formatted retrieved
//! chunks) and `{query}` (the user's question). A literal brace is written
//! `{{` or `}}`.

use std::fs;
use std::path::Path;

use crate::document::SearchResult;
use crate::error::{RagError, Result};
use crate::llm::Message;

/// Placeholder replaced by the retrieved context.
pub const CONTEXT: &str = "context";
/// Placeholder replaced by the user's question.
pub const QUERY: &str = "query";

const KNOWN: [&str; 2] = [CONTEXT, QUERY];

/// Rendered in place of the context when retrieval found nothing.
pub const EMPTY_CONTEXT: &str = "(no context found)";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(&'static str),
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    name: String,
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    /// Parse `text`, requiring every placeholder named in `required`.
    ///
    /// # Errors
    ///
    /// [`RagError::Template`] on an unbalanced brace, an unknown placeholder,
    /// or a missing required placeholder.
    pub fn parse(name: impl Into<String>, text: &str, required: &[&str]) -> Result<Self> {
        let name = name.into();
        let fail = |message: String| RagError::Template { template: name.clone(), message };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.char_indices().peekable();

        while let Some((at, c)) = chars.next() {
            match c {
                '{' if chars.peek().is_some_and(|&(_, n)| n == '{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().is_some_and(|&(_, n)| n == '}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut placeholder = String::new();
                    let mut closed = false;
                    for (_, n) in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        if n == '{' {
                            break;
                        }
                        placeholder.push(n);
                    }
                    if !closed {
                        return Err(fail(format!("unclosed '{{' at byte {at}")));
                    }
                    let key = placeholder.trim();
                    let known = KNOWN.iter().copied().find(|k| *k == key).ok_or_else(|| {
                        fail(format!(
                            "unknown placeholder '{{{key}}}', expected one of {{context}}, {{query}} \
                             (write '{{{{' for a literal brace)"
                        ))
                    })?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(known));
                }
                '}' => return Err(fail(format!("unmatched '}}' at byte {at}"))),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let missing: Vec<String> = required
            .iter()
            .copied()
            .filter(|r| !segments.iter().any(|s| matches!(s, Segment::Placeholder(p) if *p == *r)))
            .map(|r| format!("{{{r}}}"))
            .collect();
        if !missing.is_empty() {
            return Err(fail(format!("missing required placeholder(s): {}", missing.join(", "))));
        }

        Ok(Self { name, source: text.to_string(), segments })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unparsed template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Substitute the placeholders.
    pub fn render(&self, context: &str, query: &str) -> String {
        let mut out = String::with_capacity(self.source.len() + context.len() + query.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(p) if *p == CONTEXT => out.push_str(context),
                Segment::Placeholder(_) => out.push_str(query),
            }
        }
        out
    }
}

/// The system and user templates used to build a chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub system: PromptTemplate,
    pub user: PromptTemplate,
}

impl PromptTemplates {
    /// Parse both templates. The user template must use `{context}` and `{query}`.
    pub fn new(system: &str, user: &str) -> Result<Self> {
        Ok(Self {
            system: PromptTemplate::parse("system", system, &[])?,
            user: PromptTemplate::parse("user", user, &[CONTEXT, QUERY])?,
        })
    }

    /// Read `dir/system_file` and `dir/user_file`, trimming surrounding whitespace.
    pub fn load(dir: &Path, system_file: &str, user_file: &str) -> Result<Self> {
        let system = read_template(dir, system_file)?;
        let user = read_template(dir, user_file)?;
        Ok(Self {
            system: PromptTemplate::parse(system_file, &system, &[])?,
            user: PromptTemplate::parse(user_file, &user, &[CONTEXT, QUERY])?,
        })
    }

    /// Build the `[system, user]` messages for one question.
    pub fn render(&self, question: &str, context: &str) -> Vec<Message> {
        vec![
            Message::system(self.system.render(context, question)),
            Message::user(self.user.render(context, question)),
        ]
    }
}

fn read_template(dir: &Path, file: &str) -> Result<String> {
    let path = dir.join(file);
    fs::read_to_string(&path).map(|text| text.trim().to_string()).map_err(|e| RagError::Template {
        template: file.to_string(),
        message: format!("cannot read prompt file {}: {e}", path.display()),
    })
}

/// Format retrieved chunks as numbered, attributed passages.
pub fn format_context(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return EMPTY_CONTEXT.to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let chunk = &result.chunk;
            let source = chunk.source().unwrap_or(&chunk.document_id);
            match chunk.page() {
                Some(page) => format!("[{}] {source} (page {page})\n{}", i + 1, chunk.text.trim()),
                None => format!("[{}] {source}\n{}", i + 1, chunk.text.trim()),
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::document::{Chunk, PAGE_KEY, SOURCE_KEY};
    use crate::llm::Role;

    #[test]
    fn renders_placeholders_and_escapes() {
        let t = PromptTemplate::parse("user", "Q: {query}\nC: {context}\nJSON: {{\"a\": 1}}", &[]).unwrap();
        assert_eq!(t.render("ctx", "why?"), "Q: why?\nC: ctx\nJSON: {\"a\": 1}");
    }

    #[test]
    fn user_template_without_context_is_rejected() {
        let err = PromptTemplates::new("You answer questions.", "Question: {query}").unwrap_err();
        match err {
            RagError::Template { template, message } => {
                assert_eq!(template, "user");
                assert!(message.contains("{context}"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_and_unbalanced_placeholders_are_rejected() {
        assert!(PromptTemplate::parse("t", "{question}", &[]).is_err());
        assert!(PromptTemplate::parse("t", "open {context", &[]).is_err());
        assert!(PromptTemplate::parse("t", "close }", &[]).is_err());
        assert!(PromptTemplate::parse("t", "{ context }", &[CONTEXT]).is_ok());
    }

    #[test]
    fn render_produces_system_then_user() {
        let templates = PromptTemplates::new("Be precise.", "{context}\n\n{query}").unwrap();
        let messages = templates.render("What is X?", "X is Y.");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "X is Y.\n\nWhat is X?");
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system.txt"), "  sys  \n").unwrap();
        let err = PromptTemplates::load(dir.path(), "system.txt", "user_query.txt").unwrap_err();
        assert!(matches!(err, RagError::Template { template, .. } if template == "user_query.txt"));

        std::fs::write(dir.path().join("user_query.txt"), "{context}\n{query}\n").unwrap();
        let templates = PromptTemplates::load(dir.path(), "system.txt", "user_query.txt").unwrap();
        assert_eq!(templates.system.source(), "sys");
    }

    #[test]
    fn context_is_numbered_and_attributed() {
        let mut metadata = HashMap::new();
        metadata.insert(SOURCE_KEY.to_string(), "manual.pdf".to_string());
        metadata.insert(PAGE_KEY.to_string(), "4".to_string());
        let result = SearchResult {
            chunk: Chunk {
                id: "1".into(),
                text: " body ".into(),
                embedding: Vec::new(),
                metadata,
                document_id: "manual-p4".into(),
                start: 0,
                end: 6,
                overlap: 0,
            },
            score: 0.8,
        };
        assert_eq!(format_context(&[result]), "[1] manual.pdf (page 4)\nbody");
        assert_eq!(format_context(&[]), EMPTY_CONTEXT);
    }
}
