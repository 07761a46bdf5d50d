//! Line parsers mapping raw subprocess output to progress events.
//!
//! Parsers form an ordered chain: the first one returning `Some` wins, and a
//! line no parser understands is dropped (that is not an error). The
//! structured marker parser is preferred; the percentage-bar and log-phrase
//! parsers cover tools that only write human-oriented progress lines.

use std::sync::LazyLock;

use regex::Regex;

use super::event::{ProgressEvent, ProgressLevel};

/// A single pattern matcher in the parser chain.
pub type LineParser = fn(&str) -> Option<ProgressEvent>;

/// Run `line` through `parsers` in order; first non-empty result wins.
pub fn parse_line(parsers: &[LineParser], line: &str) -> Option<ProgressEvent> {
    parsers.iter().find_map(|parser| parser(line))
}

/// Structured in-band markers printed by stage processes.
///
/// `PROGRESS|init|<total>|<message>` or
/// `PROGRESS|<level>|<current>/<total>|<message>` with
/// level ∈ {row, chunk, page, embed}.
pub fn parse_progress_marker(line: &str) -> Option<ProgressEvent> {
    let rest = line.strip_prefix("PROGRESS|")?;
    let mut parts = rest.splitn(3, '|');
    let level = parts.next()?.trim().to_ascii_lowercase();
    let counts = parts.next()?.trim().to_string();
    let message = parts.next().map(|m| m.trim().to_string());

    if level == "init" {
        let total: u64 = counts.parse().ok()?;
        return Some(ProgressEvent::Init {
            total: Some(total),
            message: message.unwrap_or_else(|| format!("Found {total} items")),
        });
    }

    let level = ProgressLevel::parse(&level)?;
    let (current_str, total_str) = counts.split_once('/')?;
    let current: u64 = current_str.trim().parse().ok()?;
    let total: u64 = total_str.trim().parse().ok()?;

    Some(ProgressEvent::Progress {
        level: Some(level),
        current,
        total: Some(total),
        percent: Some(ProgressEvent::percent_of(current, total)),
        item: None,
        message: message
            .unwrap_or_else(|| format!("{} {current}/{total}", level.as_str())),
    })
}

static PERCENT_BAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)%\|.*?\|\s*(\d+)/(\d+)").expect("percent bar regex"));
static PERCENT_BAR_DESC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+):").expect("percent bar desc regex"));

/// Generic textual progress bars: `<desc>: NN%|████| C/T [...]`.
pub fn parse_percent_bar(line: &str) -> Option<ProgressEvent> {
    let caps = PERCENT_BAR.captures(line)?;
    let percent: u32 = caps[1].parse().ok()?;
    let current: u64 = caps[2].parse().ok()?;
    let total: u64 = caps[3].parse().ok()?;

    let message = PERCENT_BAR_DESC
        .captures(line)
        .map(|d| d[1].trim().to_string())
        .unwrap_or_else(|| "Processing".to_string());

    Some(ProgressEvent::Progress {
        level: None,
        current,
        total: Some(total),
        percent: Some(percent),
        item: None,
        message: format!("{message}: {current}/{total}"),
    })
}

static ITEMS_DETECTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+items").expect("items detected regex"));
static ITEM_SAVED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Item\s+\S+\s+saved\s+\((\d+)\s+total\)").expect("item saved regex"));
static RESUMING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Resuming:\s+(\d+)/(\d+)\s+(?:items\s+)?already\s+processed")
        .expect("resuming regex")
});

/// Log phrases written by the extraction stage.
pub fn parse_extraction_log(line: &str) -> Option<ProgressEvent> {
    if line.to_ascii_lowercase().contains("detected") {
        if let Some(caps) = ITEMS_DETECTED.captures(line) {
            let total: u64 = caps[1].parse().ok()?;
            return Some(ProgressEvent::Init {
                total: Some(total),
                message: format!("Found {total} items to process"),
            });
        }
    }

    if let Some(caps) = ITEM_SAVED.captures(line) {
        let current: u64 = caps[1].parse().ok()?;
        return Some(ProgressEvent::Progress {
            level: None,
            current,
            total: None,
            percent: None,
            item: None,
            message: format!("Processed {current} items"),
        });
    }

    if let Some(caps) = RESUMING.captures(line) {
        let done: u64 = caps[1].parse().ok()?;
        let total: u64 = caps[2].parse().ok()?;
        return Some(ProgressEvent::Init {
            total: Some(total),
            message: format!("Resuming: {done}/{total} already done"),
        });
    }

    None
}

static DOCUMENT_CHUNKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Document\s+#(\d+)\s+processed.*?(\d+)\s+chunks").expect("document chunked regex")
});
static CHUNKS_LOADED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Loading\s+(\d+)\s+chunks").expect("chunks loaded regex"));

/// Log phrases written by the chunking stage.
pub fn parse_chunking_log(line: &str) -> Option<ProgressEvent> {
    if let Some(caps) = DOCUMENT_CHUNKED.captures(line) {
        let doc_num: u64 = caps[1].parse().ok()?;
        let chunk_count: u64 = caps[2].parse().ok()?;
        return Some(ProgressEvent::Progress {
            level: None,
            current: doc_num,
            total: None,
            percent: None,
            item: None,
            message: format!("Document #{doc_num}: {chunk_count} chunks generated"),
        });
    }

    if let Some(caps) = CHUNKS_LOADED.captures(line) {
        let total: u64 = caps[1].parse().ok()?;
        return Some(ProgressEvent::Init {
            total: Some(total),
            message: format!("Loading {total} chunks for processing"),
        });
    }

    None
}

static EMBEDDING_BATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Embedded\s+batch\s+(\d+)/(\d+)").expect("embedding batch regex")
});

/// Log phrases written by the embedding stages.
pub fn parse_embedding_log(line: &str) -> Option<ProgressEvent> {
    if line.contains("Phase") {
        let lower = line.to_ascii_lowercase();
        if lower.contains("dense") || lower.contains("sparse") || lower.contains("initial") {
            return Some(ProgressEvent::Init {
                total: None,
                message: line.trim().to_string(),
            });
        }
    }

    if let Some(caps) = EMBEDDING_BATCH.captures(line) {
        let current: u64 = caps[1].parse().ok()?;
        let total: u64 = caps[2].parse().ok()?;
        return Some(ProgressEvent::Progress {
            level: Some(ProgressLevel::Embed),
            current,
            total: Some(total),
            percent: Some(ProgressEvent::percent_of(current, total)),
            item: None,
            message: format!("Embedded batch {current}/{total}"),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_row_progress() {
        let event = parse_progress_marker("PROGRESS|row|5/20|doc.pdf").unwrap();
        assert_eq!(
            event,
            ProgressEvent::Progress {
                level: Some(ProgressLevel::Row),
                current: 5,
                total: Some(20),
                percent: Some(25),
                item: None,
                message: "doc.pdf".to_string(),
            }
        );
    }

    #[test]
    fn marker_init() {
        let event = parse_progress_marker("PROGRESS|init|20|Found 20 items").unwrap();
        assert_eq!(
            event,
            ProgressEvent::Init {
                total: Some(20),
                message: "Found 20 items".to_string(),
            }
        );
    }

    #[test]
    fn marker_zero_total_reports_zero_percent() {
        let event = parse_progress_marker("PROGRESS|page|3/0|OCR page 3").unwrap();
        match event {
            ProgressEvent::Progress { percent, .. } => assert_eq!(percent, Some(0)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn marker_rejects_unknown_level_and_garbage() {
        assert!(parse_progress_marker("PROGRESS|banana|1/2|x").is_none());
        assert!(parse_progress_marker("PROGRESS|row|notanumber|x").is_none());
        assert!(parse_progress_marker("PROGRESS|row").is_none());
        assert!(parse_progress_marker("no marker here").is_none());
    }

    #[test]
    fn percent_bar_with_description() {
        let line = "Processing items: 45%|████▌     | 45/100 [00:23<00:28,  1.98it/s]";
        let event = parse_percent_bar(line).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Progress {
                level: None,
                current: 45,
                total: Some(100),
                percent: Some(45),
                item: None,
                message: "Processing items: 45/100".to_string(),
            }
        );
    }

    #[test]
    fn percent_bar_without_description() {
        let line = "100%|██████████| 100/100 [01:23<00:00,  1.20it/s]";
        let event = parse_percent_bar(line).unwrap();
        match event {
            ProgressEvent::Progress {
                current,
                total,
                percent,
                ..
            } => {
                assert_eq!((current, total, percent), (100, Some(100), Some(100)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn extraction_log_phrases() {
        let init = parse_extraction_log("Detected source manifest with 150 items").unwrap();
        assert_eq!(
            init,
            ProgressEvent::Init {
                total: Some(150),
                message: "Found 150 items to process".to_string(),
            }
        );

        let resume = parse_extraction_log("Resuming: 30/150 items already processed").unwrap();
        assert_eq!(
            resume,
            ProgressEvent::Init {
                total: Some(150),
                message: "Resuming: 30/150 already done".to_string(),
            }
        );

        let saved = parse_extraction_log("Item A1B2C3 saved (45 total)").unwrap();
        match saved {
            ProgressEvent::Progress { current, .. } => assert_eq!(current, 45),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn chunking_log_phrases() {
        let event = parse_chunking_log("Document #5 processed, 15 chunks produced").unwrap();
        match event {
            ProgressEvent::Progress {
                current, message, ..
            } => {
                assert_eq!(current, 5);
                assert!(message.contains("15 chunks"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let init = parse_chunking_log("Loading 450 chunks from output_chunks.json").unwrap();
        assert_eq!(
            init,
            ProgressEvent::Init {
                total: Some(450),
                message: "Loading 450 chunks for processing".to_string(),
            }
        );
    }

    #[test]
    fn chain_prefers_first_match_and_drops_unknown_lines() {
        let parsers: Vec<LineParser> =
            vec![parse_progress_marker, parse_percent_bar, parse_extraction_log];

        // Marker wins even though the line also contains a slash pair.
        let event = parse_line(&parsers, "PROGRESS|row|1/2|x").unwrap();
        assert!(matches!(event, ProgressEvent::Progress { .. }));

        assert!(parse_line(&parsers, "just an ordinary log line").is_none());
    }
}
