//! Contact group mutations.
//!
//! Group names are matched case-insensitively but stored with the casing
//! they were created with. Members are email addresses, also matched
//! case-insensitively.

use schema::records::{validate_email, validate_name};
use schema::{email_key, name_key, Groups, ValidationError};

use super::{FileManager, MutationError};
use crate::ratelimit::OperationClass;

/// The stored name of the group matching `name`, if any.
fn find_group<'a>(groups: &'a Groups, name: &str) -> Option<&'a String> {
    let key = name_key(name);
    groups.keys().find(|g| name_key(g) == key)
}

fn require_group(groups: &Groups, name: &str) -> Result<(), MutationError> {
    match find_group(groups, name) {
        Some(_) => Ok(()),
        None => Err(MutationError::not_found("group", name)),
    }
}

fn rename_group_in(mut groups: Groups, old: &str, new: &str) -> Groups {
    if let Some(stored) = find_group(&groups, old).cloned() {
        if let Some(members) = groups.remove(&stored) {
            groups.insert(new.to_string(), members);
        }
    }
    groups
}

fn add_member(mut groups: Groups, group: &str, email: &str) -> Groups {
    let stored = find_group(&groups, group)
        .cloned()
        .unwrap_or_else(|| group.to_string());
    let members = groups.entry(stored).or_default();
    let key = email_key(email);
    if !members.iter().any(|m| email_key(m) == key) {
        members.push(email.trim().to_string());
    }
    groups
}

fn remove_member(mut groups: Groups, group: &str, email: &str) -> Groups {
    let key = email_key(email);
    if let Some(stored) = find_group(&groups, group).cloned() {
        if let Some(members) = groups.get_mut(&stored) {
            members.retain(|m| email_key(m) != key);
        }
    }
    groups
}

fn validate_groups(groups: &Groups) -> Result<(), ValidationError> {
    let mut seen = Vec::with_capacity(groups.len());
    for (name, members) in groups {
        validate_name("group", name)?;
        let key = name_key(name);
        if seen.contains(&key) {
            return Err(ValidationError::Duplicate {
                kind: "group",
                key: name.clone(),
            });
        }
        seen.push(key);
        for member in members {
            validate_email(member)?;
        }
    }
    Ok(())
}

impl FileManager {
    /// Create an empty group.
    pub async fn add_group(&self, name: &str) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_name("group", name)?;
        let name = name.trim().to_string();

        self.run(
            "add_group",
            |groups: &Groups| match find_group(groups, &name) {
                Some(existing) => Err(ValidationError::Duplicate {
                    kind: "group",
                    key: existing.clone(),
                }
                .into()),
                None => Ok(()),
            },
            |mut groups: Groups| {
                if find_group(&groups, &name).is_none() {
                    groups.insert(name.clone(), Vec::new());
                }
                groups
            },
        )
        .await
    }

    /// Delete a group. Its members stay in the directory.
    pub async fn remove_group(&self, name: &str) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;

        self.run(
            "remove_group",
            |groups: &Groups| require_group(groups, name),
            |mut groups: Groups| {
                if let Some(stored) = find_group(&groups, name).cloned() {
                    groups.remove(&stored);
                }
                groups
            },
        )
        .await
    }

    /// Rename a group, keeping its members.
    pub async fn rename_group(&self, old: &str, new: &str) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_name("group", new)?;
        let new = new.trim().to_string();

        self.run(
            "rename_group",
            |groups: &Groups| {
                require_group(groups, old)?;
                let same_group = name_key(old) == name_key(&new);
                if !same_group && find_group(groups, &new).is_some() {
                    return Err(ValidationError::Duplicate {
                        kind: "group",
                        key: new.clone(),
                    }
                    .into());
                }
                Ok(())
            },
            |groups| rename_group_in(groups, old, &new),
        )
        .await
    }

    /// Add `email` to `group`. Adding an existing member is a no-op.
    pub async fn add_contact_to_group(
        &self,
        group: &str,
        email: &str,
    ) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_email(email)?;

        self.run(
            "add_contact_to_group",
            |groups: &Groups| require_group(groups, group),
            |groups| add_member(groups, group, email),
        )
        .await
    }

    /// Remove `email` from `group`.
    pub async fn remove_contact_from_group(
        &self,
        group: &str,
        email: &str,
    ) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;

        let key = email_key(email);
        self.run(
            "remove_contact_from_group",
            |groups: &Groups| {
                let stored = find_group(groups, group)
                    .ok_or_else(|| MutationError::not_found("group", group))?;
                let is_member = groups
                    .get(stored)
                    .is_some_and(|members| members.iter().any(|m| email_key(m) == key));
                if is_member {
                    Ok(())
                } else {
                    Err(MutationError::not_found("group member", email))
                }
            },
            |groups| remove_member(groups, group, email),
        )
        .await
    }

    /// Replace every group at once.
    pub async fn save_groups(&self, groups: Groups) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_groups(&groups)?;

        self.run(
            "save_groups",
            |_: &Groups| Ok(()),
            |_| groups.clone(),
        )
        .await
    }
}
