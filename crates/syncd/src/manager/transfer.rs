//! CSV import and export.
//!
//! Imports read a user-chosen file from anywhere and upsert every valid row
//! in one write. Exports land under the data root like any other file.

use std::path::Path;

use schema::{Contact, Server};
use tracing::{info, warn};

use super::contacts::{upsert_contact, upsert_server};
use super::{FileManager, MutationError};
use crate::files::{csv_io, SkippedRow, WriteReceipt};
use crate::ratelimit::OperationClass;

/// Outcome of a CSV import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// Rows written to the collection.
    pub imported: usize,
    /// Rows left out, with the reason.
    pub skipped: Vec<SkippedRow>,
}

impl FileManager {
    /// Import contacts from a CSV file, replacing entries with the same email.
    pub async fn import_contacts_csv(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<ImportSummary, MutationError> {
        let bytes = self.read_import(path.as_ref()).await?;
        let parsed = csv_io::parse_contacts(&bytes)?;
        log_skipped("contacts", &parsed.skipped);

        let imported = parsed.records.len();
        let records = parsed.records;
        self.run(
            "import_contacts_csv",
            |_: &Vec<Contact>| Ok(()),
            |contacts| {
                records
                    .iter()
                    .fold(contacts, |acc, contact| upsert_contact(acc, contact))
            },
        )
        .await?;

        info!(imported, skipped = parsed.skipped.len(), "Contacts imported");
        Ok(ImportSummary {
            imported,
            skipped: parsed.skipped,
        })
    }

    /// Import servers from a CSV file, replacing entries with the same name.
    pub async fn import_servers_csv(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<ImportSummary, MutationError> {
        let bytes = self.read_import(path.as_ref()).await?;
        let parsed = csv_io::parse_servers(&bytes)?;
        log_skipped("servers", &parsed.skipped);

        let imported = parsed.records.len();
        let records = parsed.records;
        self.run(
            "import_servers_csv",
            |_: &Vec<Server>| Ok(()),
            |servers| {
                records
                    .iter()
                    .fold(servers, |acc, server| upsert_server(acc, server))
            },
        )
        .await?;

        info!(imported, skipped = parsed.skipped.len(), "Servers imported");
        Ok(ImportSummary {
            imported,
            skipped: parsed.skipped,
        })
    }

    /// Write the cached contacts as CSV to `rel_path` under the data root.
    pub async fn export_contacts_csv(
        &self,
        rel_path: impl AsRef<Path>,
    ) -> Result<WriteReceipt, MutationError> {
        self.admit(OperationClass::FsOpen)?;
        let bytes = csv_io::contacts_to_csv(&self.cache.get_cache().contacts)?;
        let receipt = self.writer.atomic_write_with_bom(rel_path, &bytes).await?;
        info!(path = %receipt.path.display(), bytes = receipt.bytes, "Contacts exported");
        Ok(receipt)
    }

    /// Write the cached servers as CSV to `rel_path` under the data root.
    pub async fn export_servers_csv(
        &self,
        rel_path: impl AsRef<Path>,
    ) -> Result<WriteReceipt, MutationError> {
        self.admit(OperationClass::FsOpen)?;
        let bytes = csv_io::servers_to_csv(&self.cache.get_cache().servers)?;
        let receipt = self.writer.atomic_write_with_bom(rel_path, &bytes).await?;
        info!(path = %receipt.path.display(), bytes = receipt.bytes, "Servers exported");
        Ok(receipt)
    }

    async fn read_import(&self, path: &Path) -> Result<Vec<u8>, MutationError> {
        self.admit(OperationClass::FsOpen)?;
        self.admit(OperationClass::Import)?;
        tokio::fs::read(path)
            .await
            .map_err(|source| MutationError::ImportRead {
                path: path.to_path_buf(),
                source,
            })
    }
}

fn log_skipped(kind: &str, skipped: &[SkippedRow]) {
    for row in skipped {
        warn!(kind, line = row.line, reason = %row.reason, "Skipping CSV row");
    }
}
