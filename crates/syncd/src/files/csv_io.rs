//! CSV import and export for contacts and servers.
//!
//! Headers are matched case-insensitively with spaces, underscores and
//! dashes ignored, so `Business Area`, `business_area` and `BusinessArea`
//! all name the same column. Rows that fail validation are skipped and
//! reported rather than failing the whole import.

use std::collections::HashMap;

use schema::{Contact, Server, ValidationError};
use thiserror::Error;

use super::atomic::strip_bom;

/// Errors that can occur while reading or writing CSV.
#[derive(Debug, Error)]
pub enum CsvError {
    /// Malformed CSV.
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    /// A required column is absent from the header row.
    #[error("missing required column: {0}")]
    MissingColumn(&'static str),

    /// The output buffer could not be finalized.
    #[error("failed to finish CSV output: {0}")]
    Finish(String),
}

/// A row that was not imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    /// 1-based line number in the source, counting the header.
    pub line: u64,
    /// Why the row was rejected.
    pub reason: String,
}

/// Parsed records plus the rows that were left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvImport<T> {
    /// Valid records, in file order.
    pub records: Vec<T>,
    /// Rejected rows.
    pub skipped: Vec<SkippedRow>,
}

const CONTACT_HEADERS: [&str; 4] = ["name", "email", "phone", "title"];

const SERVER_HEADERS: [&str; 8] = [
    "name",
    "business_area",
    "lob",
    "comment",
    "owner",
    "contact",
    "os_type",
    "os",
];

fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Column positions keyed by normalized header.
struct Columns(HashMap<String, usize>);

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let mut map = HashMap::new();
        for (i, header) in headers.iter().enumerate() {
            // First occurrence wins for duplicated headers.
            map.entry(normalize_header(header)).or_insert(i);
        }
        Self(map)
    }

    fn find(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|a| self.0.get(*a).copied())
    }

    fn require(&self, name: &'static str, aliases: &[&str]) -> Result<usize, CsvError> {
        self.find(aliases).ok_or(CsvError::MissingColumn(name))
    }
}

fn field(record: &csv::StringRecord, column: Option<usize>) -> String {
    column
        .and_then(|i| record.get(i))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(strip_bom(bytes))
}

fn is_blank(record: &csv::StringRecord) -> bool {
    record.iter().all(|f| f.trim().is_empty())
}

fn line_of(record: &csv::StringRecord, fallback: u64) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(fallback)
}

fn parse_rows<T, L>(
    bytes: &[u8],
    layout: impl FnOnce(&Columns) -> Result<L, CsvError>,
    build: impl Fn(&L, &csv::StringRecord) -> T,
    validate: impl Fn(&T) -> Result<(), ValidationError>,
) -> Result<CsvImport<T>, CsvError> {
    let mut reader = reader(bytes);
    let columns = Columns::from_headers(reader.headers()?);
    let layout = layout(&columns)?;

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row?;
        if is_blank(&row) {
            continue;
        }
        let record = build(&layout, &row);
        match validate(&record) {
            Ok(()) => records.push(record),
            Err(e) => skipped.push(SkippedRow {
                line: line_of(&row, i as u64 + 2),
                reason: e.to_string(),
            }),
        }
    }

    Ok(CsvImport { records, skipped })
}

/// Parse contacts from CSV bytes.
pub fn parse_contacts(bytes: &[u8]) -> Result<CsvImport<Contact>, CsvError> {
    parse_rows(
        bytes,
        |columns| {
            Ok([
                Some(columns.require("name", &["name", "fullname"])?),
                Some(columns.require("email", &["email", "emailaddress", "mail"])?),
                columns.find(&["phone", "phonenumber"]),
                columns.find(&["title", "jobtitle"]),
            ])
        },
        |[name, email, phone, title]: &[Option<usize>; 4], row: &csv::StringRecord| Contact {
            name: field(row, *name),
            email: field(row, *email),
            phone: field(row, *phone),
            title: field(row, *title),
        },
        Contact::validate,
    )
}

/// Parse servers from CSV bytes.
pub fn parse_servers(bytes: &[u8]) -> Result<CsvImport<Server>, CsvError> {
    parse_rows(
        bytes,
        |columns| {
            Ok([
                Some(columns.require("name", &["name", "servername", "server"])?),
                columns.find(&["businessarea"]),
                columns.find(&["lob", "lineofbusiness"]),
                columns.find(&["comment", "comments"]),
                columns.find(&["owner"]),
                columns.find(&["contact"]),
                columns.find(&["ostype"]),
                columns.find(&["os"]),
            ])
        },
        |[name, business_area, lob, comment, owner, contact, os_type, os]: &[Option<usize>; 8],
         row: &csv::StringRecord| Server {
            name: field(row, *name),
            business_area: field(row, *business_area),
            lob: field(row, *lob),
            comment: field(row, *comment),
            owner: field(row, *owner),
            contact: field(row, *contact),
            os_type: field(row, *os_type),
            os: field(row, *os),
        },
        Server::validate,
    )
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, CsvError> {
    writer
        .into_inner()
        .map_err(|e| CsvError::Finish(e.error().to_string()))
}

/// Serialize contacts to CSV bytes, without a byte-order marker.
pub fn contacts_to_csv(contacts: &[Contact]) -> Result<Vec<u8>, CsvError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CONTACT_HEADERS)?;
    for c in contacts {
        writer.write_record([&c.name, &c.email, &c.phone, &c.title])?;
    }
    finish(writer)
}

/// Serialize servers to CSV bytes, without a byte-order marker.
pub fn servers_to_csv(servers: &[Server]) -> Result<Vec<u8>, CsvError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(SERVER_HEADERS)?;
    for s in servers {
        writer.write_record([
            &s.name,
            &s.business_area,
            &s.lob,
            &s.comment,
            &s.owner,
            &s.contact,
            &s.os_type,
            &s.os,
        ])?;
    }
    finish(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::atomic::ensure_bom;

    #[test]
    fn test_header_normalization() {
        assert_eq!(normalize_header("Business Area"), "businessarea");
        assert_eq!(normalize_header("business_area"), "businessarea");
        assert_eq!(normalize_header("OS-Type"), "ostype");
    }

    #[test]
    fn test_parse_contacts_with_bom_and_mixed_headers() {
        let csv = ensure_bom(
            b"Full Name,E-mail Address,Phone Number,Job Title\n\
              Alice Smith,alice@example.com,555-0100,SRE\n\
              ,,,\n\
              Bob Jones,bob@example.com,,\n",
        );
        let import = parse_contacts(&csv).unwrap();

        assert_eq!(import.records.len(), 2);
        assert_eq!(import.records[0].name, "Alice Smith");
        assert_eq!(import.records[0].phone, "555-0100");
        assert_eq!(import.records[0].title, "SRE");
        assert_eq!(import.records[1].email, "bob@example.com");
        assert!(import.skipped.is_empty());
    }

    #[test]
    fn test_invalid_rows_are_skipped_with_line_numbers() {
        let csv = b"name,email\nAlice,alice@example.com\nNo Email,not-an-email\n";
        let import = parse_contacts(csv).unwrap();

        assert_eq!(import.records.len(), 1);
        assert_eq!(import.skipped.len(), 1);
        assert_eq!(import.skipped[0].line, 3);
        assert!(import.skipped[0].reason.contains("not-an-email"));
    }

    #[test]
    fn test_missing_required_column() {
        let err = parse_contacts(b"name,phone\nAlice,555\n").unwrap_err();
        assert!(matches!(err, CsvError::MissingColumn("email")));
    }

    #[test]
    fn test_parse_servers() {
        let csv = b"Server Name,Business Area,LOB,Comment,Owner,Contact,OS Type,OS\n\
            SRV-001,Finance,Payments,primary,alice@example.com,bob@example.com,Linux,RHEL 9\n";
        let import = parse_servers(csv).unwrap();
        let server = &import.records[0];

        assert_eq!(server.name, "SRV-001");
        assert_eq!(server.business_area, "Finance");
        assert_eq!(server.os_type, "Linux");
        assert_eq!(server.os, "RHEL 9");
    }

    #[test]
    fn test_export_then_import_contacts() {
        let contacts = vec![
            Contact::new("Alice, Jr.", "alice@example.com").with_title("Lead \"SRE\""),
            Contact::new("Bob", "bob@example.com").with_phone("555-0101"),
        ];
        let csv = contacts_to_csv(&contacts).unwrap();
        assert!(csv.starts_with(b"name,email,phone,title\n"));

        let import = parse_contacts(&csv).unwrap();
        assert_eq!(import.records, contacts);
    }

    #[test]
    fn test_export_servers_header() {
        let csv = servers_to_csv(&[Server::new("SRV-001")]).unwrap();
        let text = String::from_utf8(csv).unwrap();
        assert!(text.starts_with("name,business_area,lob,comment,owner,contact,os_type,os\n"));
        assert!(text.contains("SRV-001,,,,,,,"));
    }
}
