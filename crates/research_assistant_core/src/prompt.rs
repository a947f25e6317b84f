//! crates/research_assistant_core/src/prompt.rs
//!
//! Builds the provider-agnostic prompt text sent with every generation call.

use crate::domain::{char_prefix, AnalysisType, ConversationContext, DocumentExcerpt};
use crate::ports::Prompt;

/// The fixed system instruction that describes the assistant's role.
pub const BASE_INSTRUCTIONS: &str = "You are an expert academic research assistant. Help researchers write high-quality papers with proper structure, citations, and academic language.";

/// Default number of document characters included with a chat turn.
pub const DOCUMENT_EXCERPT_CHARS: usize = 3000;

/// Number of document characters included in an analysis request.
pub const ANALYSIS_EXCERPT_CHARS: usize = 4000;

/// Combines instructions, context metadata, an optional document excerpt and
/// the recent transcript into one block of text.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    base_instructions: String,
    excerpt_chars: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(BASE_INSTRUCTIONS, DOCUMENT_EXCERPT_CHARS)
    }
}

impl ContextAssembler {
    pub fn new(base_instructions: impl Into<String>, excerpt_chars: usize) -> Self {
        Self {
            base_instructions: base_instructions.into(),
            excerpt_chars,
        }
    }

    pub fn assemble(
        &self,
        context: &ConversationContext,
        document: Option<&DocumentExcerpt>,
        recent_context: &str,
    ) -> String {
        let mut out = self.base_instructions.clone();

        out.push_str(&format!("\n\nPaper Type: {}", context.paper_type.as_str()));
        out.push_str(&format!("\nCurrent Stage: {}", context.stage.as_str()));
        if let Some(subject) = context.subject.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push_str(&format!("\nSubject: {}", subject.trim()));
        }

        if let Some(doc) = document {
            out.push_str(&format!(
                "\n\nDocument Context:\nTitle: {}\nContent: {}",
                doc.title,
                excerpt(&doc.text, self.excerpt_chars)
            ));
        }

        if !recent_context.is_empty() {
            out.push_str("\n\nRecent conversation:\n");
            out.push_str(recent_context);
        }

        out
    }
}

/// Prompt for a one-shot document analysis.
pub fn analysis_prompt(analysis_type: AnalysisType, text: &str) -> Prompt {
    let body = excerpt(text, ANALYSIS_EXCERPT_CHARS);
    let query = match analysis_type {
        AnalysisType::General => format!(
            "Please analyze this academic document and provide feedback on:\n\
             1. Overall structure and organization\n\
             2. Clarity of arguments\n\
             3. Academic writing style\n\
             4. Suggestions for improvement\n\n\
             Document text: {}",
            body
        ),
        AnalysisType::Grammar => format!(
            "Please review this text for grammar, spelling, and style issues. \
             Provide specific corrections and suggestions:\n\n{}",
            body
        ),
        AnalysisType::Plagiarism => format!(
            "Analyze this text for potential originality issues. Look for:\n\
             1. Common phrases that might need citation\n\
             2. Academic concepts that require references\n\
             3. Suggestions for improving originality\n\n\
             Text: {}",
            body
        ),
        AnalysisType::Structure => format!(
            "Evaluate the structure of this academic paper. Comment on:\n\
             1. Introduction effectiveness\n\
             2. Methodology clarity\n\
             3. Results presentation\n\
             4. Conclusion strength\n\
             5. Overall flow and coherence\n\n\
             Document: {}",
            body
        ),
    };
    Prompt {
        instructions: String::new(),
        query,
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match char_prefix(text, max_chars) {
        Some(prefix) => format!("{}...", prefix),
        None => text.to_string(),
    }
}
