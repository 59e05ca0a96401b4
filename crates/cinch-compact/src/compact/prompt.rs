//! Summarization prompt, summary cleanup, and the continuation message.

use crate::CompactError;
use std::path::Path;

/// Responses starting with this carry an upstream error instead of a summary.
pub const API_ERROR_PREFIX: &str = "API Error";
/// Responses starting with this mean the request itself overflowed the window.
pub const PROMPT_TOO_LONG_PREFIX: &str = "Prompt is too long";

const NO_TOOLS_REMINDER: &str = "IMPORTANT: Do NOT use any tools. You MUST respond with ONLY the <summary>...</summary> block as your text output.";

const SUMMARIZATION_PROMPT: &str = "\
Your task is to create a detailed summary of the conversation so far, paying close attention to the user's explicit requests and your previous actions.
This summary should be thorough in capturing technical details, code patterns, and architectural decisions that would be essential for continuing development work without losing context.

Before providing your final summary, wrap your analysis in <analysis> tags to organize your thoughts and make sure you've covered all necessary points. In your analysis:

1. Go through each message and section of the conversation in order. For each section identify:
   - The user's explicit requests and intents
   - Your approach to addressing them
   - Key decisions, technical concepts and code patterns
   - Specific details like file names, full code snippets, function signatures and file edits
   - Errors you ran into and how you fixed them
   - Specific user feedback, especially where the user asked you to do something differently
2. Double-check for technical accuracy and completeness.

Your summary should include the following sections:

1. Primary Request and Intent: the user's explicit requests and intents in detail
2. Key Technical Concepts: technologies, frameworks and concepts discussed
3. Files and Code Sections: files examined, modified or created, with code snippets where they matter and why each file is important
4. Errors and fixes: errors encountered, how they were fixed, and any user feedback on them
5. Problem Solving: problems solved and troubleshooting still in progress
6. All user messages: every user message that is not a tool result
7. Pending Tasks: tasks you were explicitly asked to work on that are not done
8. Current Work: precisely what was being worked on immediately before this summary request, with file names and code snippets
9. Optional Next Step: the next step, only if it is directly in line with the most recent request, quoting the conversation to show exactly where you left off

Use this structure:

<analysis>
[Your thought process, making sure all points are covered]
</analysis>

<summary>
1. Primary Request and Intent:
   [Detailed description]

2. Key Technical Concepts:
   - [Concept 1]
   - [Concept 2]

3. Files and Code Sections:
   - [File Name 1]
      - [Why this file is important]
      - [Summary of the changes made, if any]
      - [Important code snippet]

4. Errors and fixes:
    - [Error description]:
      - [How it was fixed]
      - [User feedback on the error, if any]

5. Problem Solving:
   [Description]

6. All user messages:
    - [Detailed non tool-use user message]

7. Pending Tasks:
   - [Task 1]

8. Current Work:
   [Precise description of current work]

9. Optional Next Step:
   [Optional next step to take]
</summary>";

/// The instruction appended after the conversation. Custom instructions are
/// included verbatim.
pub fn build_summarization_prompt(custom_instructions: Option<&str>) -> String {
    let mut prompt = format!("{SUMMARIZATION_PROMPT}\n\n{NO_TOOLS_REMINDER}");
    if let Some(custom) = custom_instructions
        && !custom.trim().is_empty()
    {
        prompt.push_str("\n\nAdditional Instructions:\n");
        prompt.push_str(custom);
    }
    prompt.push_str("\n\n");
    prompt.push_str(NO_TOOLS_REMINDER);
    prompt
}

/// Replace the first `<tag>…</tag>` with `Label:\n…`.
fn replace_tag(text: &str, tag: &str, label: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let Some(start) = text.find(&open) else {
        return text.to_string();
    };
    let inner_start = start + open.len();
    let Some(inner_len) = text.get(inner_start..).and_then(|rest| rest.find(&close)) else {
        return text.to_string();
    };
    let inner = text.get(inner_start..inner_start + inner_len).unwrap_or_default();
    let end = inner_start + inner_len + close.len();
    format!(
        "{}{label}:\n{}{}",
        text.get(..start).unwrap_or_default(),
        inner.trim(),
        text.get(end..).unwrap_or_default()
    )
}

/// Collapse runs of blank lines into one.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out
}

/// Convert the model's tagged output to plain text.
pub fn clean_summary(raw: &str) -> String {
    let text = replace_tag(raw, "analysis", "Analysis");
    let text = replace_tag(&text, "summary", "Summary");
    collapse_blank_lines(&text).trim().to_string()
}

/// The user-role message that opens a compacted transcript.
pub fn format_summary_for_continuation(
    summary: &str,
    auto_resume: bool,
    transcript_path: Option<&Path>,
    has_preserved_messages: bool,
) -> String {
    let mut text = format!(
        "This session is being continued from a previous conversation that ran out of context. \
         The summary below covers the earlier portion of the conversation.\n\n{}",
        clean_summary(summary)
    );
    if let Some(path) = transcript_path {
        text.push_str(&format!(
            "\n\nIf you need specific details from before compaction (like exact code snippets, \
             error messages, or content you generated), read the full transcript at: {}",
            path.display()
        ));
    }
    if has_preserved_messages {
        text.push_str("\n\nRecent messages are preserved verbatim.");
    }
    if auto_resume {
        text.push_str(
            "\nPlease continue the conversation from where we left it off without asking the user \
             any further questions. Continue with the last task that you were asked to work on.",
        );
    }
    text
}

/// Check the summarizer's output, returning the text if it is usable.
pub fn validate_summary(text: &str) -> Result<&str, CompactError> {
    if text.trim().is_empty() {
        return Err(CompactError::SummaryMissing);
    }
    if text.starts_with(API_ERROR_PREFIX) {
        return Err(CompactError::Upstream(text.to_string()));
    }
    if text.starts_with(PROMPT_TOO_LONG_PREFIX) {
        return Err(CompactError::PromptTooLong);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_instructions_are_appended_verbatim() {
        let prompt = build_summarization_prompt(Some("Focus on *tests*\n  and TODOs"));
        assert!(prompt.contains("\n\nAdditional Instructions:\nFocus on *tests*\n  and TODOs\n\n"));
        assert!(prompt.ends_with(NO_TOOLS_REMINDER));
        assert!(!build_summarization_prompt(Some("   ")).contains("Additional Instructions"));
        assert!(!build_summarization_prompt(None).contains("Additional Instructions"));
    }

    #[test]
    fn prompt_lists_all_sections() {
        let prompt = build_summarization_prompt(None);
        for section in [
            "1. Primary Request and Intent",
            "4. Errors and fixes",
            "6. All user messages",
            "9. Optional Next Step",
        ] {
            assert!(prompt.contains(section), "missing {section}");
        }
    }

    #[test]
    fn clean_summary_strips_tags() {
        let raw = "<analysis>\n  thinking...\n</analysis>\n\n\n\n<summary>\n1. Intent: fix parser\n</summary>\n";
        assert_eq!(
            clean_summary(raw),
            "Analysis:\nthinking...\n\nSummary:\n1. Intent: fix parser"
        );
    }

    #[test]
    fn clean_summary_tolerates_missing_tags() {
        assert_eq!(clean_summary("  plain text\n\n\n\nmore "), "plain text\n\nmore");
        assert_eq!(clean_summary("<summary>unterminated"), "<summary>unterminated");
    }

    #[test]
    fn continuation_message_parts() {
        let path = Path::new("/tmp/s1.jsonl");
        let text = format_summary_for_continuation("<summary>done</summary>", true, Some(path), true);
        assert!(text.starts_with("This session is being continued from a previous conversation"));
        assert!(text.contains("Summary:\ndone"));
        assert!(text.contains("read the full transcript at: /tmp/s1.jsonl"));
        assert!(text.contains("\n\nRecent messages are preserved verbatim."));
        assert!(text.ends_with("Continue with the last task that you were asked to work on."));

        let bare = format_summary_for_continuation("s", false, None, false);
        assert!(!bare.contains("transcript at"));
        assert!(!bare.contains("preserved verbatim"));
        assert!(!bare.contains("Please continue"));
    }

    #[test]
    fn validation_classifies_output() {
        assert!(matches!(validate_summary("  "), Err(CompactError::SummaryMissing)));
        assert!(matches!(
            validate_summary("API Error: HTTP 401"),
            Err(CompactError::Upstream(t)) if t == "API Error: HTTP 401"
        ));
        assert!(matches!(
            validate_summary("Prompt is too long: 210k > 200k"),
            Err(CompactError::PromptTooLong)
        ));
        assert_eq!(validate_summary("Summary: ok").unwrap(), "Summary: ok");
    }
}
