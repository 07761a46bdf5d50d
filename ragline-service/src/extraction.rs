//! Resumable text extraction from source-manifest attachments.
//!
//! A run loads the manifest, skips items the checkpoint already covers,
//! resolves each remaining item's PDF attachments (with fuzzy filename
//! matching), extracts text through the OCR provider chain under a retry
//! policy, and commits per item through the journal writer. Interrupting a
//! run at any point loses at most the item in flight.

pub mod engine;
pub mod fuzzy;
pub mod journal;
pub mod manifest;
pub mod ocr;
pub mod retry;

pub use engine::{ExtractionEngine, ExtractionReport};
pub use journal::{
    Checkpoint, ExtractionRecord, FailureRecord, JournalPaths, JournalWriter, load_checkpoint,
    read_records,
};
pub use manifest::{Attachment, SourceItem, load_manifest, parse_manifest};
pub use ocr::{LocalTextExtractor, OcrEngine, OcrOutcome, RemoteOcr, TextExtractor, VisionOcr};
pub use retry::RetryPolicy;
