use std::fmt::Write as _;

use regex::Regex;
use tern_llm::{Message, Role};

use crate::Context;

const NO_MATCHING_LINE: &str = "[Pattern matched in content]";

/// Prompt handed to a watch subagent in place of the caller's prompt.
pub fn build_watch_prompt(
    base_prompt: &str,
    watch_target: &str,
    trigger_pattern: &str,
    on_trigger: Option<&str>,
    continue_after_trigger: bool,
) -> String {
    let mut prompt = String::from("You are a monitoring agent. Your task:\n\n");
    if !base_prompt.trim().is_empty() {
        let _ = write!(prompt, "Background: {}\n\n", base_prompt);
    }

    prompt.push_str("Watch configuration:\n");
    let _ = writeln!(prompt, "- Target: {}", watch_target);
    let _ = writeln!(prompt, "- Trigger pattern: {}", trigger_pattern);
    if let Some(action) = on_trigger.filter(|action| !action.trim().is_empty()) {
        let _ = writeln!(prompt, "- On trigger: {}", action);
    }

    prompt.push_str("\nInstructions:\n");
    prompt.push_str("1. Use the available tools to run the monitoring commands\n");
    let _ = writeln!(
        prompt,
        "2. Check their output against the regular expression `{}`",
        trigger_pattern
    );
    prompt.push_str("3. When it matches, report the trigger event\n");
    if continue_after_trigger {
        prompt.push_str("4. Keep monitoring after a trigger\n");
    } else {
        prompt.push_str("4. Stop monitoring after a trigger and report the result\n");
    }
    prompt
}

/// First line of `content` matching `pattern`, cut to `max_chars`.
pub fn find_matched_line(content: &str, pattern: &Regex, max_chars: usize) -> String {
    match content.lines().find(|line| pattern.is_match(line)) {
        Some(line) if line.chars().count() > max_chars => {
            let truncated: String = line.chars().take(max_chars).collect();
            format!("{}...", truncated)
        }
        Some(line) => line.to_string(),
        None => NO_MATCHING_LINE.to_string(),
    }
}

/// Index and text of the newest tool message in `context`.
pub(crate) fn last_tool_output(context: &dyn Context) -> Option<(usize, String)> {
    let history = context.history();
    history
        .iter()
        .enumerate()
        .rev()
        .find(|(_, message)| message.role == Role::Tool)
        .map(|(index, message)| (index, message.text().to_string()))
}

/// The answer of a finished run: its latest assistant text.
pub(crate) fn extract_result(history: &[Message]) -> String {
    if history.is_empty() {
        return "(No history)".to_string();
    }
    match history
        .iter()
        .rev()
        .find(|message| message.role == Role::Assistant)
    {
        Some(message) => match message.content.as_deref() {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => "(No content)".to_string(),
        },
        None => "(No assistant response)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryContext;

    #[test]
    fn watch_prompt_mentions_target_pattern_and_stop_rule() {
        let prompt = build_watch_prompt(
            "keep an eye on the build",
            "cargo build log",
            "error\\[E\\d+\\]",
            Some("summarize the error"),
            false,
        );

        assert!(prompt.contains("Background: keep an eye on the build"));
        assert!(prompt.contains("- Target: cargo build log"));
        assert!(prompt.contains("- On trigger: summarize the error"));
        assert!(prompt.contains("`error\\[E\\d+\\]`"));
        assert!(prompt.ends_with("4. Stop monitoring after a trigger and report the result\n"));
    }

    #[test]
    fn watch_prompt_skips_blank_sections() {
        let prompt = build_watch_prompt("  ", "logs", "ERROR", Some(""), true);

        assert!(!prompt.contains("Background:"));
        assert!(!prompt.contains("On trigger"));
        assert!(prompt.ends_with("4. Keep monitoring after a trigger\n"));
    }

    #[test]
    fn matched_line_is_truncated() {
        let pattern = Regex::new("ERROR").expect("regex");
        let long_line = format!("ERROR {}", "x".repeat(300));
        let content = format!("ok\n{}\nERROR second", long_line);

        let line = find_matched_line(&content, &pattern, 200);

        assert_eq!(line.chars().count(), 203);
        assert!(line.starts_with("ERROR xxx"));
        assert!(line.ends_with("..."));
        assert_eq!(find_matched_line("ERROR short", &pattern, 200), "ERROR short");
    }

    #[test]
    fn multiline_match_without_single_line_hit_uses_placeholder() {
        let pattern = Regex::new("(?s)start.*end").expect("regex");

        assert_eq!(
            find_matched_line("start\nend", &pattern, 200),
            "[Pattern matched in content]"
        );
    }

    #[test]
    fn result_is_latest_assistant_text() {
        assert_eq!(extract_result(&[]), "(No history)");
        assert_eq!(
            extract_result(&[Message::user("hi")]),
            "(No assistant response)"
        );
        assert_eq!(
            extract_result(&[
                Message::user("hi"),
                Message::assistant(Some("first".to_string()), Vec::new()),
                Message::tool("call-1", "output"),
                Message::assistant(Some("final".to_string()), Vec::new()),
            ]),
            "final"
        );
        assert_eq!(
            extract_result(&[Message::assistant(None, Vec::new())]),
            "(No content)"
        );
    }

    #[test]
    fn last_tool_output_reports_position() {
        let context = InMemoryContext::new();
        assert_eq!(last_tool_output(&context), None);

        context.add_message(Message::user("watch"));
        context.add_message(Message::tool("call-1", "all good"));
        context.add_message(Message::assistant(Some("ok".to_string()), Vec::new()));

        assert_eq!(
            last_tool_output(&context),
            Some((1, "all good".to_string()))
        );
    }
}
