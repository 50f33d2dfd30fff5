//! Record definitions for every Relay collection.
//!
//! Records serialize with camelCase field names, which is the on-disk format
//! shared with the desktop application. Optional text fields default to the
//! empty string so hand-edited files with missing columns still load.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};

/// Maximum length of any single text field.
pub const MAX_FIELD_LEN: usize = 512;

/// Normalized lookup key for an email address.
pub fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Normalized lookup key for a server, group or team name.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    bounded(field, value)
}

fn bounded(field: &'static str, value: &str) -> Result<()> {
    if value.chars().count() > MAX_FIELD_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_FIELD_LEN,
        });
    }
    Ok(())
}

/// Check that `email` looks like `local@domain.tld`.
pub fn validate_email(email: &str) -> Result<()> {
    require("email", email)?;
    let email = email.trim();
    let invalid = || ValidationError::InvalidEmail(email.to_string());

    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid());
    }
    Ok(())
}

/// Validate a group or team name.
pub fn validate_name(field: &'static str, name: &str) -> Result<()> {
    require(field, name)?;
    if name.chars().any(char::is_control) {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

/// A person in the directory, keyed by email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Display name.
    pub name: String,
    /// Email address; the natural key of the collection.
    pub email: String,
    /// Phone number, free form.
    #[serde(default)]
    pub phone: String,
    /// Job title.
    #[serde(default)]
    pub title: String,
}

impl Contact {
    /// Create a contact with only a name and email.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            ..Default::default()
        }
    }

    /// Set the phone number.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = phone.into();
        self
    }

    /// Set the job title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Lookup key for this contact.
    pub fn key(&self) -> String {
        email_key(&self.email)
    }

    /// Validate the record.
    pub fn validate(&self) -> Result<()> {
        require("name", &self.name)?;
        validate_email(&self.email)?;
        bounded("phone", &self.phone)?;
        bounded("title", &self.title)
    }
}

/// An inventory server, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Server host name; the natural key of the collection.
    pub name: String,
    /// Owning business area.
    #[serde(default)]
    pub business_area: String,
    /// Line of business.
    #[serde(default)]
    pub lob: String,
    /// Free-form comment.
    #[serde(default)]
    pub comment: String,
    /// Owner email.
    #[serde(default)]
    pub owner: String,
    /// Support contact email.
    #[serde(default)]
    pub contact: String,
    /// Operating system family (e.g. "Windows", "Linux").
    #[serde(default)]
    pub os_type: String,
    /// Operating system version.
    #[serde(default)]
    pub os: String,
}

impl Server {
    /// Create a server record with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Lookup key for this server.
    pub fn key(&self) -> String {
        name_key(&self.name)
    }

    /// Validate the record.
    pub fn validate(&self) -> Result<()> {
        require("name", &self.name)?;
        for (field, value) in [
            ("businessArea", &self.business_area),
            ("lob", &self.lob),
            ("comment", &self.comment),
            ("owner", &self.owner),
            ("contact", &self.contact),
            ("osType", &self.os_type),
            ("os", &self.os),
        ] {
            bounded(field, value)?;
        }
        Ok(())
    }
}

/// One row of an on-call rota.
///
/// Rows are grouped by `team`; the order of teams in the collection is the
/// order in which the board shows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OnCallRow {
    /// Stable row identifier.
    pub id: String,
    /// Team this row belongs to.
    pub team: String,
    /// Role within the team (e.g. "Primary").
    pub role: String,
    /// Person on call.
    #[serde(default)]
    pub name: String,
    /// Phone number or email used to reach the person.
    #[serde(default)]
    pub contact: String,
    /// Optional shift window, free form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<String>,
}

impl OnCallRow {
    /// Create a row.
    pub fn new(
        id: impl Into<String>,
        team: impl Into<String>,
        role: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            team: team.into(),
            role: role.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Validate the record.
    pub fn validate(&self) -> Result<()> {
        require("id", &self.id)?;
        validate_name("team", &self.team)?;
        require("role", &self.role)?;
        bounded("name", &self.name)?;
        bounded("contact", &self.contact)?;
        if let Some(window) = &self.time_window {
            bounded("timeWindow", window)?;
        }
        Ok(())
    }
}

/// Position of a team card on the on-call board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TeamPosition {
    /// Horizontal offset.
    pub x: f64,
    /// Vertical offset.
    pub y: f64,
}

impl TeamPosition {
    /// Create a position.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Validate the position for `team`.
    pub fn validate(&self, team: &str) -> Result<()> {
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(ValidationError::InvalidPosition {
                team: team.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_validation() {
        let contact = Contact::new("Alice Smith", "alice@example.com").with_phone("555-0100");
        assert!(contact.validate().is_ok());

        let unnamed = Contact::new("  ", "alice@example.com");
        assert_eq!(
            unnamed.validate(),
            Err(ValidationError::EmptyField { field: "name" })
        );
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("reese.dalton100@agency.net").is_ok());
        assert!(validate_email("  bob@example.com ").is_ok());

        for bad in ["bob", "bob@", "@example.com", "bob@example", "a b@example.com", "a@b@c.com"] {
            assert!(
                matches!(validate_email(bad), Err(ValidationError::InvalidEmail(_))),
                "{bad} should be rejected"
            );
        }
        assert_eq!(
            validate_email(""),
            Err(ValidationError::EmptyField { field: "email" })
        );
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let a = Contact::new("A", "Alice@Example.com");
        let b = Contact::new("B", "alice@example.COM ");
        assert_eq!(a.key(), b.key());
        assert_eq!(Server::new("SRV-001").key(), Server::new("srv-001").key());
    }

    #[test]
    fn test_field_length_limit() {
        let server = Server {
            comment: "x".repeat(MAX_FIELD_LEN + 1),
            ..Server::new("DB-02")
        };
        assert_eq!(
            server.validate(),
            Err(ValidationError::TooLong {
                field: "comment",
                max: MAX_FIELD_LEN
            })
        );
    }

    #[test]
    fn test_on_call_row_validation() {
        let row = OnCallRow::new("r1", "Ops", "Primary", "Alice");
        assert!(row.validate().is_ok());

        let no_team = OnCallRow::new("r1", "", "Primary", "Alice");
        assert_eq!(
            no_team.validate(),
            Err(ValidationError::EmptyField { field: "team" })
        );
    }

    #[test]
    fn test_position_must_be_finite() {
        assert!(TeamPosition::new(10.0, 20.5).validate("Ops").is_ok());
        assert!(TeamPosition::new(f64::NAN, 0.0).validate("Ops").is_err());
        assert!(TeamPosition::new(0.0, f64::INFINITY).validate("Ops").is_err());
    }

    #[test]
    fn test_server_json_uses_camel_case() {
        let server = Server {
            business_area: "Finance".to_string(),
            os_type: "Windows".to_string(),
            ..Server::new("SRV-001")
        };
        let json = serde_json::to_string(&server).unwrap();
        assert!(json.contains("\"businessArea\":\"Finance\""));
        assert!(json.contains("\"osType\":\"Windows\""));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let contact: Contact =
            serde_json::from_str(r#"{"name":"Bob","email":"bob@example.com"}"#).unwrap();
        assert_eq!(contact.phone, "");
        assert_eq!(contact.title, "");
    }
}
