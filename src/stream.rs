//! Events from the agent CLI's stream-json output format.
//!
//! The agent backend is opaque: it consumes a prompt and emits a line-
//! delimited JSON event stream ending in a `result` event that carries
//! turn, token, and cost counters.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<Value>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    match name {
        "Read" | "Write" | "Edit" => {
            let verb = match name {
                "Read" => "Reading",
                "Write" => "Creating",
                _ => "Editing",
            };
            let path = input
                .get("file_path")
                .and_then(|v| v.as_str())
                .map(shorten_path)
                .unwrap_or_else(|| "file".to_string());
            format!("{verb}: {path}")
        }
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 48))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {cmd}")
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("Searching: {pattern}")
        }
        "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 32))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {pattern}")
        }
        "Task" => {
            let desc = input
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("subagent");
            format!("Agent: {desc}")
        }
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

/// Truncate assistant text to a single-line snippet for the status display.
pub fn truncate_snippet(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    truncate_str(first_line.trim(), max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_event_with_usage() {
        let json = r#"{"type":"result","subtype":"success","result":"done","is_error":false,
                       "num_turns":12,"total_cost_usd":0.42,
                       "usage":{"input_tokens":1000,"output_tokens":250}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Result {
                subtype,
                num_turns,
                total_cost_usd,
                usage,
                is_error,
                ..
            } => {
                assert_eq!(subtype, "success");
                assert_eq!(num_turns, 12);
                assert!(!is_error);
                assert!((total_cost_usd - 0.42).abs() < f64::EPSILON);
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 1000);
                assert_eq!(usage.output_tokens, 250);
            }
            _ => panic!("expected Result event"),
        }
    }

    #[test]
    fn test_parse_assistant_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/foo/bar.rs"},"id":"123"}]},"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        if let StreamEvent::Assistant { message, .. } = event {
            assert!(matches!(
                &message.content[0],
                ContentBlock::ToolUse { name, .. } if name == "Read"
            ));
        } else {
            panic!("expected Assistant event");
        }
    }

    #[test]
    fn test_parse_assistant_text() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"SUMMARY\nAll done"}]},"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        if let StreamEvent::Assistant { message, .. } = event {
            if let ContentBlock::Text { text } = &message.content[0] {
                assert!(text.contains("All done"));
            } else {
                panic!("expected Text block");
            }
        } else {
            panic!("expected Assistant event");
        }
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/home/u/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(
            describe_tool_use("Bash", &input),
            "Running: cargo test --release"
        );
    }

    #[test]
    fn test_truncate_snippet_first_line_only() {
        assert_eq!(truncate_snippet("hello\nworld", 60), "hello");
        assert_eq!(truncate_snippet("  padded  ", 60), "padded");
    }
}
