//! Prompt construction for the memory agent conversation.
//!
//! The init prompt establishes the observer role and the reply wire format;
//! later prompts carry one tool event or a summarize request each.

use chrono::{DateTime, Utc};

/// Reply-format contract sent once, with the init prompt.
const MODE_DEFINITION: &str = r#"You are a memory observer for a coding assistant. You receive tool-use events and distill them into structured records. Reply only with the tags described here; plain prose outside the tags is discarded.

For each noteworthy event, emit:
<observation>
  <type>discovery|bugfix|feature|refactor|change|decision|session|prompt</type>
  <title>short label</title>
  <subtitle>optional qualifier</subtitle>
  <narrative>one paragraph of what happened and why it matters</narrative>
  <facts><item>short fact</item></facts>
  <concepts><item>topic</item></concepts>
  <files_read><item>path</item></files_read>
  <files_modified><item>path</item></files_modified>
</observation>

When asked to summarize a session, emit exactly one:
<summary>
  <request>what the user wanted</request>
  <investigated>what was examined</investigated>
  <learned>what was learned</learned>
  <completed>what was finished</completed>
  <next_steps>what remains</next_steps>
  <notes>anything else worth keeping</notes>
</summary>

Skip trivial events by replying with no tags at all."#;

/// First message of a session's conversation.
pub fn init_prompt(project: &str, content_session_id: &str, user_prompt: &str) -> String {
    let mut prompt = format!(
        "{MODE_DEFINITION}\n\nProject: {project}\nSession: {content_session_id}\n"
    );
    if !user_prompt.is_empty() {
        prompt.push_str(&format!("The user opened with:\n{user_prompt}\n"));
    }
    prompt
}

/// Sent when a session resumes with a fresh user prompt.
pub fn continuation_prompt(user_prompt: &str, prompt_number: i64) -> String {
    format!("The user continued (prompt #{prompt_number}):\n{user_prompt}")
}

/// One tool-use event.
pub fn observation_prompt(
    tool_name: &str,
    tool_input: Option<&str>,
    tool_response: Option<&str>,
    captured_at: DateTime<Utc>,
    cwd: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Tool event at {}:\ntool: {tool_name}\n",
        captured_at.to_rfc3339()
    );
    if let Some(dir) = cwd {
        prompt.push_str(&format!("cwd: {dir}\n"));
    }
    if let Some(input) = tool_input {
        prompt.push_str(&format!("input:\n{input}\n"));
    }
    if let Some(output) = tool_response {
        prompt.push_str(&format!("output:\n{output}\n"));
    }
    prompt.push_str("Record what matters as <observation> blocks, or nothing.");
    prompt
}

/// End-of-session summarize request.
pub fn summary_prompt(last_assistant_message: Option<&str>) -> String {
    let mut prompt = String::from(
        "The session is ending. Summarize it as a single <summary> block.\n",
    );
    if let Some(message) = last_assistant_message {
        prompt.push_str(&format!("The assistant's final message was:\n{message}\n"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_prompt_carries_format_and_context() {
        let prompt = init_prompt("proj", "cs-1", "hello there");
        assert!(prompt.contains("<observation>"));
        assert!(prompt.contains("<summary>"));
        assert!(prompt.contains("Project: proj"));
        assert!(prompt.contains("Session: cs-1"));
        assert!(prompt.contains("hello there"));
    }

    #[test]
    fn init_prompt_without_user_prompt() {
        let prompt = init_prompt("proj", "cs-1", "");
        assert!(!prompt.contains("opened with"));
    }

    #[test]
    fn observation_prompt_includes_blobs_verbatim() {
        let prompt = observation_prompt(
            "Bash",
            Some(r#"{"command":"ls"}"#),
            Some("file.txt"),
            Utc::now(),
            Some("/work"),
        );
        assert!(prompt.contains("tool: Bash"));
        assert!(prompt.contains(r#"{"command":"ls"}"#));
        assert!(prompt.contains("file.txt"));
        assert!(prompt.contains("cwd: /work"));
    }

    #[test]
    fn summary_prompt_mentions_last_message() {
        let prompt = summary_prompt(Some("All tests pass now."));
        assert!(prompt.contains("All tests pass now."));
        assert!(summary_prompt(None).contains("<summary>"));
    }
}
