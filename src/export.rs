//! Read-only renderings of a conversation for download.

use chrono::NaiveDate;

use crate::errors::AppError;
use crate::models::{Conversation, MessageRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "md",
            ExportFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "text/markdown",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn render(&self, conversation: &Conversation) -> Result<String, AppError> {
        match self {
            ExportFormat::Markdown => Ok(to_markdown(conversation)),
            ExportFormat::Json => to_json(conversation),
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("Unknown export format: {other}")),
        }
    }
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "🧑 **You**",
        MessageRole::Assistant => "🤖 **Assistant**",
    }
}

/// Title heading, a model / creation-date block, then one section per message.
pub fn to_markdown(conversation: &Conversation) -> String {
    let mut out = format!(
        "# {}\n\n**Model:** {}\n**Created:** {}\n\n---\n\n",
        conversation.title,
        conversation.model,
        conversation.created_at.format("%Y-%m-%d"),
    );
    for message in &conversation.messages {
        out.push_str(&format!(
            "## {} ({})\n\n{}\n\n",
            role_label(message.role),
            message.timestamp.format("%H:%M:%S"),
            message.content,
        ));
    }
    out
}

/// The full conversation as pretty-printed JSON, in the stored shape.
pub fn to_json(conversation: &Conversation) -> Result<String, AppError> {
    Ok(serde_json::to_string_pretty(conversation)?)
}

/// `<title with non-alphanumerics as '-'>-<YYYY-MM-DD>.<ext>`
pub fn export_filename(title: &str, date: NaiveDate, format: ExportFormat) -> String {
    let stem: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{stem}-{}.{}", date.format("%Y-%m-%d"), format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use chrono::{TimeZone, Utc};

    fn sample() -> Conversation {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 5).unwrap();
        let mut user = Message::user("hi there");
        user.timestamp = at;
        let mut reply = Message::assistant("llama3.2:latest");
        reply.content = "Hello!\n\n```rust\nfn main() {}\n```".into();
        reply.timestamp = at + chrono::Duration::seconds(2);

        let mut conversation = Conversation::new("llama3.2:latest");
        conversation.id = "c1".into();
        conversation.title = "hi there".into();
        conversation.created_at = at;
        conversation.updated_at = reply.timestamp;
        conversation.messages = vec![user, reply];
        conversation
    }

    #[test]
    fn markdown_has_header_and_one_section_per_message() {
        let markdown = to_markdown(&sample());
        assert!(markdown.starts_with(
            "# hi there\n\n**Model:** llama3.2:latest\n**Created:** 2024-01-15\n\n---\n\n"
        ));
        assert!(markdown.contains("## 🧑 **You** (09:30:05)\n\nhi there\n\n"));
        assert!(markdown.contains("## 🤖 **Assistant** (09:30:07)\n\nHello!\n\n```rust"));
        assert_eq!(markdown.matches("\n## ").count(), 2);
    }

    #[test]
    fn exports_are_pure() {
        let conversation = sample();
        assert_eq!(to_markdown(&conversation), to_markdown(&conversation));
        assert_eq!(to_json(&conversation).unwrap(), to_json(&conversation).unwrap());
    }

    #[test]
    fn json_export_reloads_to_the_same_conversation() {
        let conversation = sample();
        let json = to_json(&conversation).unwrap();
        assert!(json.contains("\n  \"title\": \"hi there\""));
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conversation);
    }

    #[test]
    fn filename_replaces_non_alphanumerics() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(
            export_filename("explain how binary search works in...", date, ExportFormat::Markdown),
            "explain-how-binary-search-works-in----2024-01-15.md"
        );
        assert_eq!(export_filename("Q&A", date, ExportFormat::Json), "Q-A-2024-01-15.json");
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("markdown".parse::<ExportFormat>(), Ok(ExportFormat::Markdown));
        assert_eq!("JSON".parse::<ExportFormat>(), Ok(ExportFormat::Json));
        assert!("pdf".parse::<ExportFormat>().is_err());
    }
}
