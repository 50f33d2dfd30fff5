//! Contact and server mutations.

use schema::{email_key, name_key, Contact, Server, ValidationError};

use super::{FileManager, MutationError};
use crate::ratelimit::OperationClass;

/// Insert `contact`, replacing any entry with the same email in place.
pub(crate) fn upsert_contact(mut contacts: Vec<Contact>, contact: &Contact) -> Vec<Contact> {
    let key = contact.key();
    match contacts.iter_mut().find(|c| c.key() == key) {
        Some(existing) => *existing = contact.clone(),
        None => contacts.push(contact.clone()),
    }
    contacts
}

/// Replace the contact keyed by `email`. A missing entry is left missing.
fn replace_contact(mut contacts: Vec<Contact>, email: &str, contact: &Contact) -> Vec<Contact> {
    let key = email_key(email);
    if let Some(pos) = contacts.iter().position(|c| c.key() == key) {
        contacts[pos] = contact.clone();
        // The new email may collide with an entry written by someone else.
        // The replaced entry wins wherever the collision sits.
        let new_key = contact.key();
        let mut index = 0;
        contacts.retain(|c| {
            let keep = index == pos || c.key() != new_key;
            index += 1;
            keep
        });
    }
    contacts
}

/// Insert `server`, replacing any entry with the same name in place.
pub(crate) fn upsert_server(mut servers: Vec<Server>, server: &Server) -> Vec<Server> {
    let key = server.key();
    match servers.iter_mut().find(|s| s.key() == key) {
        Some(existing) => *existing = server.clone(),
        None => servers.push(server.clone()),
    }
    servers
}

fn replace_server(mut servers: Vec<Server>, name: &str, server: &Server) -> Vec<Server> {
    let key = name_key(name);
    if let Some(pos) = servers.iter().position(|s| s.key() == key) {
        servers[pos] = server.clone();
        let new_key = server.key();
        let mut index = 0;
        servers.retain(|s| {
            let keep = index == pos || s.key() != new_key;
            index += 1;
            keep
        });
    }
    servers
}

impl FileManager {
    /// Add a contact, or replace the one with the same email.
    pub async fn add_contact(&self, contact: Contact) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        contact.validate()?;

        self.run(
            "add_contact",
            |_: &Vec<Contact>| Ok(()),
            |contacts| upsert_contact(contacts, &contact),
        )
        .await
    }

    /// Replace the contact currently keyed by `email`.
    pub async fn update_contact(
        &self,
        email: &str,
        contact: Contact,
    ) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        contact.validate()?;

        let key = email_key(email);
        let new_key = contact.key();
        self.run(
            "update_contact",
            |contacts: &Vec<Contact>| {
                if !contacts.iter().any(|c| c.key() == key) {
                    return Err(MutationError::not_found("contact", email));
                }
                if new_key != key && contacts.iter().any(|c| c.key() == new_key) {
                    return Err(ValidationError::Duplicate {
                        kind: "contact",
                        key: contact.email.clone(),
                    }
                    .into());
                }
                Ok(())
            },
            |contacts| replace_contact(contacts, email, &contact),
        )
        .await
    }

    /// Remove the contact keyed by `email`.
    pub async fn remove_contact(&self, email: &str) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;

        let key = email_key(email);
        self.run(
            "remove_contact",
            |contacts: &Vec<Contact>| {
                if contacts.iter().any(|c| c.key() == key) {
                    Ok(())
                } else {
                    Err(MutationError::not_found("contact", email))
                }
            },
            |mut contacts: Vec<Contact>| {
                contacts.retain(|c| c.key() != key);
                contacts
            },
        )
        .await
    }

    /// Add a server, or replace the one with the same name.
    pub async fn add_server(&self, server: Server) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        server.validate()?;

        self.run(
            "add_server",
            |_: &Vec<Server>| Ok(()),
            |servers| upsert_server(servers, &server),
        )
        .await
    }

    /// Replace the server currently named `name`.
    pub async fn update_server(&self, name: &str, server: Server) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        server.validate()?;

        let key = name_key(name);
        let new_key = server.key();
        self.run(
            "update_server",
            |servers: &Vec<Server>| {
                if !servers.iter().any(|s| s.key() == key) {
                    return Err(MutationError::not_found("server", name));
                }
                if new_key != key && servers.iter().any(|s| s.key() == new_key) {
                    return Err(ValidationError::Duplicate {
                        kind: "server",
                        key: server.name.clone(),
                    }
                    .into());
                }
                Ok(())
            },
            |servers| replace_server(servers, name, &server),
        )
        .await
    }

    /// Remove the server named `name`.
    pub async fn remove_server(&self, name: &str) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;

        let key = name_key(name);
        self.run(
            "remove_server",
            |servers: &Vec<Server>| {
                if servers.iter().any(|s| s.key() == key) {
                    Ok(())
                } else {
                    Err(MutationError::not_found("server", name))
                }
            },
            |mut servers: Vec<Server>| {
                servers.retain(|s| s.key() != key);
                servers
            },
        )
        .await
    }
}
