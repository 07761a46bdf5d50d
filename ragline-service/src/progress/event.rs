//! Typed progress events and their wire encoding.

use serde::{Deserialize, Serialize};

/// Which unit of work a progress update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    /// Source item (primary progress)
    Row,
    /// Chunk within a document
    Chunk,
    /// PDF page
    Page,
    /// Embedding batch entry
    Embed,
}

impl ProgressLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "row" => Some(Self::Row),
            "chunk" => Some(Self::Chunk),
            "page" => Some(Self::Page),
            "embed" => Some(Self::Embed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Row => "row",
            Self::Chunk => "chunk",
            Self::Page => "page",
            Self::Embed => "embed",
        }
    }
}

/// A short-lived, non-persisted progress message for a running stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Init {
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        message: String,
    },
    Progress {
        #[serde(skip_serializing_if = "Option::is_none")]
        level: Option<ProgressLevel>,
        current: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        item: Option<String>,
        message: String,
    },
    Complete {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    /// Percentage as reported on the wire: rounded, 0 when the total is zero
    /// or unknown.
    pub fn percent_of(current: u64, total: u64) -> u32 {
        if total > 0 {
            ((current as f64 / total as f64) * 100.0).round() as u32
        } else {
            0
        }
    }

    /// Encode as the in-band stdout marker a stage process prints.
    ///
    /// Only init and progress events have a marker form; terminal events are
    /// derived from the process exit status by the streaming side.
    pub fn to_marker(&self) -> Option<String> {
        match self {
            ProgressEvent::Init { total, message } => {
                Some(format!("PROGRESS|init|{}|{}", total.unwrap_or(0), message))
            }
            ProgressEvent::Progress {
                level,
                current,
                total,
                message,
                ..
            } => {
                let level = level.unwrap_or(ProgressLevel::Row);
                Some(format!(
                    "PROGRESS|{}|{}/{}|{}",
                    level.as_str(),
                    current,
                    total.unwrap_or(0),
                    message
                ))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = ProgressEvent::Progress {
            level: Some(ProgressLevel::Row),
            current: 5,
            total: Some(20),
            percent: Some(25),
            item: None,
            message: "doc.pdf".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["level"], "row");
        assert_eq!(json["current"], 5);
        assert_eq!(json["percent"], 25);
        assert!(json.get("item").is_none());
    }

    #[test]
    fn percent_rounds_and_handles_zero_total() {
        assert_eq!(ProgressEvent::percent_of(5, 20), 25);
        assert_eq!(ProgressEvent::percent_of(1, 3), 33);
        assert_eq!(ProgressEvent::percent_of(2, 3), 67);
        assert_eq!(ProgressEvent::percent_of(7, 0), 0);
    }

    #[test]
    fn marker_roundtrip_matches_parser() {
        use crate::progress::parsers::parse_progress_marker;

        let event = ProgressEvent::Progress {
            level: Some(ProgressLevel::Chunk),
            current: 150,
            total: Some(500),
            percent: Some(30),
            item: None,
            message: "Generating embedding".to_string(),
        };
        let marker = event.to_marker().unwrap();
        assert_eq!(parse_progress_marker(&marker), Some(event));
    }
}
