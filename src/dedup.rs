//! Metadata-based duplicate detection.
//!
//! The fingerprint is derived from size, normalized name, and MIME type —
//! never from file content. Distinct files with identical metadata are
//! indistinguishable here; that is a stated limitation of the heuristic,
//! not a bug.

use sha2::{Digest, Sha256};

use crate::store::{DuplicateGroup, RecordStore, StoreError};

/// Sentinel substituted for an absent or unreported MIME type, so a file
/// listed without one still matches a copy listed as "unknown".
const UNKNOWN_MIME: &str = "unknown";

/// Compute the metadata fingerprint for a file.
///
/// Deterministic: the name is trimmed and case-folded, the MIME type
/// normalized to [`UNKNOWN_MIME`] when absent. Returns `None` when size or
/// name is unknown — such files are never matched as duplicates.
pub fn fingerprint(size: Option<u64>, name: &str, mime_type: Option<&str>) -> Option<String> {
    let size = size?;
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return None;
    }
    let mime = mime_type
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| UNKNOWN_MIME.to_string());

    // Length-prefix each field so the encoding is unambiguous: a delimiter
    // character inside a name or mime type must not shift field boundaries.
    let mut hasher = Sha256::new();
    for field in [size.to_string().as_str(), &name, &mime] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();
    Some(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Earliest-discovered record sharing the fingerprint, excluding the given
/// external id. `None` when the fingerprint is absent or nothing matches.
pub async fn find_duplicate(
    store: &dyn RecordStore,
    file_hash: Option<&str>,
    excluding_external_id: &str,
) -> Result<Option<String>, StoreError> {
    match file_hash {
        Some(hash) => store.find_duplicate_of(hash, excluding_external_id).await,
        None => Ok(None),
    }
}

/// All fingerprint groups with at least two members, largest first.
pub async fn find_all_duplicate_groups(
    store: &dyn RecordStore,
) -> Result<Vec<DuplicateGroup>, StoreError> {
    store.duplicate_groups().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewFileRecord, SqliteRecordStore};

    #[test]
    fn deterministic_across_calls() {
        let a = fingerprint(Some(1024), "doc.pdf", Some("application/pdf"));
        let b = fingerprint(Some(1024), "doc.pdf", Some("application/pdf"));
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn name_is_normalized() {
        // Concrete scenario from the product requirements
        assert_eq!(
            fingerprint(Some(1024), "Test.PDF", Some("application/pdf")),
            fingerprint(Some(1024), " test.pdf ", Some("application/pdf")),
        );
    }

    #[test]
    fn absent_mime_matches_unknown() {
        assert_eq!(
            fingerprint(Some(10), "a.bin", None),
            fingerprint(Some(10), "a.bin", Some("unknown")),
        );
        assert_eq!(
            fingerprint(Some(10), "a.bin", None),
            fingerprint(Some(10), "a.bin", Some("  ")),
        );
    }

    #[test]
    fn missing_size_or_name_yields_none() {
        assert_eq!(fingerprint(None, "a.bin", Some("text/plain")), None);
        assert_eq!(fingerprint(Some(10), "", Some("text/plain")), None);
        assert_eq!(fingerprint(Some(10), "   ", Some("text/plain")), None);
    }

    #[test]
    fn each_input_changes_the_fingerprint() {
        let base = fingerprint(Some(10), "a.bin", Some("text/plain"));
        assert_ne!(base, fingerprint(Some(11), "a.bin", Some("text/plain")));
        assert_ne!(base, fingerprint(Some(10), "b.bin", Some("text/plain")));
        assert_ne!(base, fingerprint(Some(10), "a.bin", Some("text/html")));
    }

    #[test]
    fn delimited_fields_do_not_collide() {
        // "1:2" + "x" vs "1" + "2:x" must hash differently
        assert_ne!(
            fingerprint(Some(12), "a:b", Some("c")),
            fingerprint(Some(12), "a", Some("b:c")),
        );
    }

    fn record(id: &str, hash: Option<&str>) -> NewFileRecord {
        NewFileRecord {
            external_id: id.to_string(),
            name: "doc.pdf".to_string(),
            url: format!("https://source.example/files/{id}"),
            size: Some(1024),
            mime_type: Some("application/pdf".to_string()),
            file_hash: hash.map(String::from),
            duplicate_of: None,
            destination_folder_id: None,
        }
    }

    #[tokio::test]
    async fn three_identical_files_form_one_group() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let hash = fingerprint(Some(1024), "doc.pdf", Some("application/pdf")).unwrap();
        for id in ["A", "B", "C"] {
            store
                .insert_discovered(&record(id, Some(&hash)))
                .await
                .unwrap();
        }

        let dup = find_duplicate(&store, Some(&hash), "B").await.unwrap();
        assert_eq!(dup.as_deref(), Some("A"));

        let groups = find_all_duplicate_groups(&store).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[0].file_hash, hash);
    }

    #[tokio::test]
    async fn no_fingerprint_never_matches() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.insert_discovered(&record("A", None)).await.unwrap();
        store.insert_discovered(&record("B", None)).await.unwrap();

        assert!(find_duplicate(&store, None, "B").await.unwrap().is_none());
        assert!(find_all_duplicate_groups(&store).await.unwrap().is_empty());
    }
}
