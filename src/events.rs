use serde::{Deserialize, Serialize};

/// One block of an assistant response, in encounter order. Produced both by
/// the agent collaborator and by the bridge CLI stream parser; consumers
/// render events in order and take the last `Text` as the final reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        input_summary: String,
        #[serde(default)]
        result_text: String,
        #[serde(default)]
        is_error: bool,
    },
}

const SUMMARY_MAX: usize = 70;

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let clipped: String = s.chars().take(max).collect();
        format!("{}...", clipped)
    } else {
        s.to_string()
    }
}

/// Compact one-line summary of a tool invocation's input, keyed off the
/// fields that matter for the common tools (file paths, commands, patterns).
pub fn summarize_tool_input(tool_name: &str, input: &serde_json::Value) -> String {
    let get = |key: &str| input.get(key).and_then(|v| v.as_str()).unwrap_or("");

    match tool_name {
        "Read" | "Write" | "Edit" | "NotebookEdit" => {
            let fp = get("file_path");
            return fp.rsplit('/').next().unwrap_or("").to_string();
        }
        "Glob" | "Grep" => return clip(get("pattern"), 60),
        "Bash" => return clip(get("command"), SUMMARY_MAX),
        _ => {}
    }

    for key in ["file_path", "command", "pattern", "query", "url"] {
        let val = get(key);
        if !val.is_empty() {
            return clip(val, SUMMARY_MAX);
        }
    }
    if let Some(obj) = input.as_object() {
        for v in obj.values() {
            if let Some(s) = v.as_str()
                && !s.is_empty()
            {
                return clip(s, 60);
            }
        }
    }
    String::new()
}
