//! Loading collections from disk during a reload.

use std::io;

use schema::{
    CachePatch, Collection, Contact, DataError, DataErrorKind, Groups, OnCallRow, Server,
    TeamLayout,
};

use super::value::CollectionValue;
use crate::files::{strip_bom, AtomicWriter};

/// Result of loading one collection.
#[derive(Debug, Default)]
pub(crate) struct LoadOutcome {
    /// New value, or `None` to keep the cached one.
    pub patch: Option<CachePatch>,
    /// Why the file could not be loaded.
    pub error: Option<DataError>,
    /// Problems that did not stop the load.
    pub warnings: Vec<DataError>,
}

/// Load `collection` from its file under the writer's root.
pub(crate) async fn load(writer: &AtomicWriter, collection: Collection) -> LoadOutcome {
    match collection {
        Collection::Contacts => load_value::<Vec<Contact>>(writer).await,
        Collection::Servers => load_value::<Vec<Server>>(writer).await,
        Collection::OnCall => load_value::<Vec<OnCallRow>>(writer).await,
        Collection::Groups => load_value::<Groups>(writer).await,
        Collection::TeamLayout => load_value::<TeamLayout>(writer).await,
    }
}

async fn load_value<T: CollectionValue>(writer: &AtomicWriter) -> LoadOutcome {
    let file = T::COLLECTION.file_name();
    let failed = |kind, message: &str, details: String| LoadOutcome {
        error: Some(
            DataError::new(kind, message)
                .with_file(file)
                .with_details(details),
        ),
        ..Default::default()
    };

    let path = match writer.resolve(file) {
        Ok(path) => path,
        Err(e) => return failed(DataErrorKind::Io, "Data file path rejected", e.to_string()),
    };

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        // First run: nothing saved yet.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return LoadOutcome {
                patch: Some(T::default().into_patch()),
                ..Default::default()
            };
        }
        Err(e) => return failed(DataErrorKind::Io, "Failed to read data file", e.to_string()),
    };

    let content = strip_bom(&bytes);
    let value = if content.iter().all(u8::is_ascii_whitespace) {
        T::default()
    } else {
        match serde_json::from_slice::<T>(content) {
            Ok(value) => value,
            Err(e) => {
                return failed(DataErrorKind::Parse, "Failed to parse data file", e.to_string())
            }
        }
    };

    let mut warnings = Vec::new();
    if let Some(invalid) = value.first_invalid() {
        warnings.push(
            DataError::new(DataErrorKind::Validation, "Data file contains invalid entries")
                .with_file(file)
                .with_details(invalid.to_string()),
        );
    }

    LoadOutcome {
        patch: Some(value.into_patch()),
        error: None,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{LockManager, BOM};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn writer(temp: &TempDir) -> AtomicWriter {
        AtomicWriter::new(
            temp.path(),
            Arc::new(LockManager::with_timings(
                "test",
                Duration::from_secs(10),
                Duration::from_millis(100),
                Duration::from_millis(10),
            )),
        )
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let outcome = load(&writer(&temp), Collection::Servers).await;
        assert_eq!(outcome.patch, Some(CachePatch::Servers(Vec::new())));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_bom_prefixed_file_loads() {
        let temp = TempDir::new().unwrap();
        let mut bytes = BOM.to_vec();
        bytes.extend_from_slice(br#"[{"name":"Alice","email":"alice@example.com"}]"#);
        std::fs::write(temp.path().join("contacts.json"), bytes).unwrap();

        let outcome = load(&writer(&temp), Collection::Contacts).await;
        match outcome.patch {
            Some(CachePatch::Contacts(contacts)) => {
                assert_eq!(contacts, vec![Contact::new("Alice", "alice@example.com")]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_reports_parse_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("groups.json"), "{ nope").unwrap();

        let outcome = load(&writer(&temp), Collection::Groups).await;
        assert!(outcome.patch.is_none());
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, DataErrorKind::Parse);
        assert_eq!(error.file.as_deref(), Some("groups.json"));
        assert!(error.details.is_some());
    }

    #[tokio::test]
    async fn test_invalid_entries_are_kept_with_warning() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("contacts.json"),
            r#"[{"name":"Bad","email":"not-an-email"}]"#,
        )
        .unwrap();

        let outcome = load(&writer(&temp), Collection::Contacts).await;
        assert_eq!(outcome.patch.map(|p| p.len()), Some(1));
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, DataErrorKind::Validation);
    }
}
