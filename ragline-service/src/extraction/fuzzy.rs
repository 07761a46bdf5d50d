//! Fuzzy attachment filename resolution.
//!
//! Attachment paths in a manifest frequently disagree with what is actually
//! on disk: accents encoded differently (NFC vs NFD), punctuation rewritten
//! by an export tool, spaces turned into underscores. Resolution first tries
//! the literal path, then compares normalized forms of the target name
//! against every file in the containing directory, accepting an exact
//! normalized match or a small edit distance between alphanumeric-only forms.

use std::path::{Path, PathBuf};

use tracing::info;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

const MAX_EDIT_DISTANCE: usize = 2;

/// NFD-decompose and drop combining marks: "Café" becomes "Cafe".
fn strip_accents(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Accent-stripped, lowercased, with whitespace collapsed to single spaces.
fn ascii_flat(s: &str) -> String {
    strip_accents(s)
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accent-stripped, lowercased, every non-alphanumeric character removed.
fn alphanum_only(s: &str) -> String {
    strip_accents(s)
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn normalized_forms(name: &str) -> Vec<String> {
    vec![
        name.nfc().collect::<String>().to_lowercase(),
        name.nfd().collect::<String>().to_lowercase(),
        strip_accents(&name.nfc().collect::<String>()).to_lowercase(),
        ascii_flat(name),
        alphanum_only(name),
    ]
}

/// Whether a directory entry plausibly is the file `target` names.
fn names_match(target: &str, candidate: &str) -> bool {
    let target_forms = normalized_forms(target);
    let candidate_forms = normalized_forms(candidate);

    if target_forms
        .iter()
        .any(|t| candidate_forms.iter().any(|c| t == c))
    {
        return true;
    }

    let t_alpha = alphanum_only(target);
    let c_alpha = alphanum_only(candidate);
    !t_alpha.is_empty()
        && !c_alpha.is_empty()
        && levenshtein(&t_alpha, &c_alpha) <= MAX_EDIT_DISTANCE
}

/// Resolve an attachment path against `base_dir`.
///
/// The literal path (absolute, or joined onto `base_dir`) wins when it
/// exists. Otherwise every file in the expected containing directory is
/// tested with [`names_match`]; the first hit is returned. `None` means the
/// attachment is genuinely missing.
pub fn resolve_attachment(attachment_path: &str, base_dir: &Path) -> Option<PathBuf> {
    let raw = Path::new(attachment_path);
    let literal = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        base_dir.join(raw)
    };
    if literal.exists() {
        return Some(literal);
    }

    let dir = literal.parent()?;
    let target = literal.file_name()?.to_string_lossy().into_owned();

    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let candidate = entry.file_name().to_string_lossy().into_owned();
        if names_match(&target, &candidate) {
            let found = dir.join(&candidate);
            info!(
                requested = %attachment_path,
                resolved = %found.display(),
                "Fuzzy filename match"
            );
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_accents_and_alphanum() {
        assert_eq!(strip_accents("Café"), "Cafe");
        assert_eq!(alphanum_only("Café (2).pdf"), "cafe2pdf");
        assert_eq!(alphanum_only("cafe_2.pdf"), "cafe2pdf");
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn accented_name_matches_flattened_file() {
        assert!(names_match("Café (2).pdf", "cafe_2.pdf"));
        assert!(!names_match("Café (2).pdf", "unrelated.pdf"));
    }

    #[test]
    fn empty_alphanum_forms_never_fuzzy_match() {
        // Punctuation-only names would otherwise match everything.
        assert!(!names_match("((( )))", "---.pdf"));
    }

    #[test]
    fn resolves_exact_then_fuzzy_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cafe_2.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("exact.pdf"), b"%PDF").unwrap();

        let exact = resolve_attachment("exact.pdf", dir.path()).unwrap();
        assert_eq!(exact, dir.path().join("exact.pdf"));

        let fuzzy = resolve_attachment("Café (2).pdf", dir.path()).unwrap();
        assert_eq!(fuzzy, dir.path().join("cafe_2.pdf"));

        assert!(resolve_attachment("missing-entirely.pdf", dir.path()).is_none());
    }
}
