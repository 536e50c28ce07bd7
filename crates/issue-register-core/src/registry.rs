use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::error::{RegisterError, RegisterResult};
use crate::model::truncate_chars;

pub const MEETING_TAG_PREFIX: &str = "Meetings.";
pub const DOCUMENT_EXCERPT_CHARS: usize = 800;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub source_id: String,
    pub title: String,
    pub path: String,
    pub tags: Vec<String>,
    pub excerpt: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentDraft {
    pub title: String,
    pub path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub text: String,
}

impl DocumentDraft {
    /// # Errors
    /// Returns [`RegisterError::Validation`] when the path or title is empty.
    pub fn validate(&self) -> RegisterResult<()> {
        if self.path.trim().is_empty() {
            return Err(RegisterError::Validation("document path MUST be non-empty".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(RegisterError::Validation("document title MUST be non-empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn excerpt(&self) -> String {
        truncate_chars(&self.text, DOCUMENT_EXCERPT_CHARS)
    }

    /// Meeting dates named by `Meetings.YYYY-MM-DD` tags, in tag order.
    #[must_use]
    pub fn meeting_tags(&self) -> Vec<(String, Date)> {
        self.tags
            .iter()
            .filter_map(|tag| meeting_date_from_tag(tag).map(|date| (tag.trim().to_string(), date)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meeting {
    pub source_id: String,
    pub title: String,
    pub source_tag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeetingDraft {
    pub title: String,
    pub source_tag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
}

impl MeetingDraft {
    /// A meeting draft for the day named by a `Meetings.YYYY-MM-DD` tag, at midnight UTC.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let date = meeting_date_from_tag(tag)?;
        Some(Self {
            title: format!("Meeting {}", format_date(date)),
            source_tag: tag.trim().to_string(),
            scheduled_at: date.midnight().assume_utc(),
        })
    }

    /// # Errors
    /// Returns [`RegisterError::Validation`] when the title is empty.
    pub fn validate(&self) -> RegisterResult<()> {
        if self.title.trim().is_empty() {
            return Err(RegisterError::Validation("meeting title MUST be non-empty".to_string()));
        }
        Ok(())
    }

    /// Upsert key: one meeting per calendar day and source tag.
    #[must_use]
    pub fn upsert_key(&self) -> (Date, String) {
        (self.scheduled_at.date(), self.source_tag.trim().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct MeetingDocumentLink {
    pub meeting_id: String,
    pub document_id: String,
}

/// Parse the date out of a `Meetings.YYYY-MM-DD` tag.
#[must_use]
pub fn meeting_date_from_tag(tag: &str) -> Option<Date> {
    let raw = tag.trim().strip_prefix(MEETING_TAG_PREFIX)?;
    parse_date(raw).ok()
}

/// # Errors
/// Returns [`RegisterError::Validation`] when `raw` is not `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> RegisterResult<Date> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| RegisterError::Validation(format!("invalid date {raw}: {err}")))
}

#[must_use]
pub fn format_date(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Documents and meetings that evidence can cite.
pub trait SourceRegistry {
    /// Insert or update a document keyed by its path.
    ///
    /// # Errors
    /// Returns validation or storage errors.
    fn register_document(&mut self, draft: DocumentDraft, at: OffsetDateTime) -> RegisterResult<Document>;

    /// Insert or update a meeting keyed by `(date, source_tag)`.
    ///
    /// # Errors
    /// Returns validation or storage errors.
    fn register_meeting(&mut self, draft: MeetingDraft, at: OffsetDateTime) -> RegisterResult<Meeting>;

    /// # Errors
    /// Returns [`RegisterError::NotFound`] when either side is unknown.
    fn link_meeting_document(&mut self, meeting_id: &str, document_id: &str) -> RegisterResult<()>;

    /// # Errors
    /// Returns storage errors.
    fn documents(&self) -> RegisterResult<Vec<Document>>;

    /// # Errors
    /// Returns storage errors.
    fn meetings(&self) -> RegisterResult<Vec<Meeting>>;

    /// Meetings scheduled in `[start, end]`, earliest first.
    ///
    /// # Errors
    /// Returns storage errors.
    fn meetings_between(&self, start: OffsetDateTime, end: OffsetDateTime) -> RegisterResult<Vec<Meeting>>;

    /// # Errors
    /// Returns storage errors.
    fn meeting_document_links(&self) -> RegisterResult<Vec<MeetingDocumentLink>>;
}

#[cfg(test)]
mod tests {
    use time::Month;

    use super::*;

    #[test]
    fn meeting_tags_parse_dates() -> RegisterResult<()> {
        let draft = DocumentDraft {
            title: "Ops sync notes".to_string(),
            path: "/library/ops-sync.epub".to_string(),
            tags: vec!["Meetings.2025-01-14".to_string(), "Ops".to_string(), "Meetings.bad".to_string()],
            text: String::new(),
        };
        let tags = draft.meeting_tags();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].1, Date::from_calendar_date(2025, Month::January, 14).map_err(|err| RegisterError::Validation(err.to_string()))?);

        let meeting = MeetingDraft::from_tag(&tags[0].0);
        let Some(meeting) = meeting else { panic!("tag should produce a meeting") };
        assert_eq!(meeting.title, "Meeting 2025-01-14");
        assert_eq!(meeting.scheduled_at.date(), tags[0].1);
        Ok(())
    }

    #[test]
    fn excerpt_is_bounded() {
        let draft = DocumentDraft {
            title: "Long".to_string(),
            path: "/long".to_string(),
            tags: vec![],
            text: "x".repeat(2_000),
        };
        assert_eq!(draft.excerpt().chars().count(), DOCUMENT_EXCERPT_CHARS);
    }
}
