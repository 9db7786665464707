use std::fmt::Write as _;
use std::path::Path;

use cadence_error::CadenceError;
use cadence_opencode_client::{Message, PartKind, Role};
use chrono::{DateTime, TimeZone};

pub const DEFAULT_EXPORT_FILE: &str = "cadence-export.md";

/// Renders a transcript: text parts joined per message, tool parts as fenced
/// blocks with their output.
pub fn render_markdown<Tz>(session_id: &str, exported_at: &DateTime<Tz>, messages: &[Message]) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut out = String::new();
    let _ = write!(
        out,
        "# Cadence export\n\n- Session: {session_id}\n- Time: {}\n\n---\n\n",
        exported_at.format("%Y-%m-%d %H:%M:%S")
    );

    for message in messages {
        out.push_str(match message.info.role {
            Role::User => "## User\n\n",
            Role::Assistant => "## Assistant\n\n",
        });

        let text = message.text();
        let text = text.trim();
        if !text.is_empty() {
            out.push_str(text);
            out.push_str("\n\n");
        }

        for part in &message.parts {
            let PartKind::Tool { tool, state } = &part.kind else {
                continue;
            };
            let title = state.title.as_deref().unwrap_or_default();
            let _ = write!(out, "\n```\ntool: {tool}\n{title}\n```\n");
            if let Some(output) = state.output.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
                let _ = write!(out, "\n```\n{output}\n```\n");
            }
        }

        out.push_str("\n---\n\n");
    }
    out
}

pub async fn write_markdown(path: &Path, markdown: &str) -> Result<(), CadenceError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| CadenceError::persistence(format!("failed to prepare {}: {err}", parent.display())))?;
    }
    tokio::fs::write(path, markdown)
        .await
        .map_err(|err| CadenceError::persistence(format!("failed to write {}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn transcript_has_sections_and_tool_blocks() {
        let messages: Vec<Message> = serde_json::from_value(json!([
            {
                "info": {"id": "m1", "sessionID": "s1", "role": "user"},
                "parts": [{"id": "p1", "sessionID": "s1", "messageID": "m1", "type": "text", "text": "  list files \n"}]
            },
            {
                "info": {"id": "m2", "sessionID": "s1", "role": "assistant"},
                "parts": [
                    {"id": "p2", "sessionID": "s1", "messageID": "m2", "type": "reasoning", "text": "hidden"},
                    {"id": "p3", "sessionID": "s1", "messageID": "m2", "type": "text", "text": "Here"},
                    {"id": "p4", "sessionID": "s1", "messageID": "m2", "type": "text", "text": " you go"},
                    {"id": "p5", "sessionID": "s1", "messageID": "m2", "type": "tool", "tool": "bash",
                     "state": {"status": "completed", "title": "ls", "output": "a.txt\n"}},
                    {"id": "p6", "sessionID": "s1", "messageID": "m2", "type": "tool", "tool": "read",
                     "state": {"status": "running"}}
                ]
            }
        ]))
        .expect("messages");
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("timestamp");

        let markdown = render_markdown("s1", &at, &messages);
        let expected = concat!(
            "# Cadence export\n\n- Session: s1\n- Time: 2026-03-04 05:06:07\n\n---\n\n",
            "## User\n\nlist files\n\n\n---\n\n",
            "## Assistant\n\nHere you go\n\n",
            "\n```\ntool: bash\nls\n```\n",
            "\n```\na.txt\n```\n",
            "\n```\ntool: read\n\n```\n",
            "\n---\n\n",
        );
        assert_eq!(markdown, expected);
        assert!(!markdown.contains("hidden"));
    }

    #[tokio::test]
    async fn markdown_is_written_to_nested_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("exports").join("s1.md");
        write_markdown(&path, "# hi\n").await.expect("write");
        assert_eq!(std::fs::read_to_string(path).expect("read"), "# hi\n");
    }
}
