//! # Relay Schema Library
//!
//! Shared data definitions for the Relay sync engine.
//!
//! ## Overview
//!
//! Every Relay data file holds one *collection*: contacts, servers, on-call
//! rows, groups, or the on-call team layout. This crate defines:
//!
//! - **Records**: the typed entries of each collection, with validation
//! - **Collections**: the identifiers that tie a collection to its file
//! - **Snapshots**: the in-memory view of every collection at once
//! - **Patches**: a tagged per-collection replacement used to update snapshots
//! - **Events**: the reload lifecycle notifications broadcast to subscribers
//!
//! ## Example Usage
//!
//! ```rust
//! use schema::{CachePatch, Collection, Contact, DataSnapshot};
//!
//! let mut snapshot = DataSnapshot::default();
//! let contact = Contact::new("Alice Smith", "alice@example.com");
//! contact.validate().unwrap();
//!
//! CachePatch::Contacts(vec![contact]).apply_to(&mut snapshot);
//! assert_eq!(snapshot.count(Collection::Contacts), 1);
//! ```
//!
//! ## Modules
//!
//! - [`records`]: Contact, server, on-call row and layout records
//! - [`collection`]: Collection identifiers and file names
//! - [`snapshot`]: Cache snapshot and patch types
//! - [`events`]: Reload lifecycle events and data errors
//! - [`error`]: Validation errors

pub mod collection;
pub mod error;
pub mod events;
pub mod records;
pub mod snapshot;

pub use collection::Collection;
pub use error::{Result, ValidationError};
pub use events::{DataError, DataErrorKind, DataEvent};
pub use records::{email_key, name_key, Contact, OnCallRow, Server, TeamPosition};
pub use snapshot::{unix_millis, CachePatch, DataSnapshot, Groups, TeamLayout};
