//! On-call rota and board layout mutations.
//!
//! Rows are stored flat; a team is every row with the same team name, and
//! teams appear on the board in the order of their first row.

use schema::records::validate_name;
use schema::{name_key, OnCallRow, TeamLayout, TeamPosition, ValidationError};

use super::{FileManager, MutationError};
use crate::ratelimit::OperationClass;

fn same_team(row: &OnCallRow, key: &str) -> bool {
    name_key(&row.team) == key
}

/// Replace the rows of `team`, keeping the team's place in the board order.
/// A team not present yet is appended.
pub(crate) fn replace_team_rows(
    rows: Vec<OnCallRow>,
    team: &str,
    new_rows: &[OnCallRow],
) -> Vec<OnCallRow> {
    let key = name_key(team);
    let insert_at = rows.iter().position(|r| same_team(r, &key));
    let mut kept: Vec<OnCallRow> = rows.into_iter().filter(|r| !same_team(r, &key)).collect();

    let at = insert_at.unwrap_or(kept.len()).min(kept.len());
    kept.splice(at..at, new_rows.iter().cloned());
    kept
}

fn rename_team_rows(mut rows: Vec<OnCallRow>, old: &str, new: &str) -> Vec<OnCallRow> {
    let key = name_key(old);
    for row in rows.iter_mut().filter(|r| same_team(r, &key)) {
        row.team = new.to_string();
    }
    rows
}

fn rename_team_layout(mut layout: TeamLayout, old: &str, new: &str) -> TeamLayout {
    let key = name_key(old);
    let stored = layout.keys().find(|t| name_key(t) == key).cloned();
    if let Some(stored) = stored {
        if let Some(position) = layout.remove(&stored) {
            layout.insert(new.to_string(), position);
        }
    }
    layout
}

/// Regroup rows so teams follow `order`. Teams missing from `order` keep
/// their relative order after the listed ones; rows within a team keep
/// theirs.
fn reorder_teams(rows: Vec<OnCallRow>, order: &[String]) -> Vec<OnCallRow> {
    let rank = |row: &OnCallRow| {
        let key = name_key(&row.team);
        order
            .iter()
            .position(|t| name_key(t) == key)
            .unwrap_or(order.len())
    };

    let mut teams: Vec<String> = Vec::new();
    for row in &rows {
        let key = name_key(&row.team);
        if !teams.contains(&key) {
            teams.push(key);
        }
    }

    let mut indexed: Vec<(usize, usize, OnCallRow)> = rows
        .into_iter()
        .map(|row| {
            let key = name_key(&row.team);
            let first_seen = teams.iter().position(|t| *t == key).unwrap_or(0);
            (rank(&row), first_seen, row)
        })
        .collect();
    // Stable sort keeps row order within a team.
    indexed.sort_by_key(|(rank, first_seen, _)| (*rank, *first_seen));
    indexed.into_iter().map(|(_, _, row)| row).collect()
}

fn validate_rows(rows: &[OnCallRow]) -> Result<(), ValidationError> {
    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        row.validate()?;
        if ids.contains(&row.id.as_str()) {
            return Err(ValidationError::Duplicate {
                kind: "row id",
                key: row.id.clone(),
            });
        }
        ids.push(row.id.as_str());
    }
    Ok(())
}

fn validate_layout(layout: &TeamLayout) -> Result<(), ValidationError> {
    for (team, position) in layout {
        validate_name("team", team)?;
        position.validate(team)?;
    }
    Ok(())
}

fn has_team(rows: &[OnCallRow], team: &str) -> bool {
    let key = name_key(team);
    rows.iter().any(|r| same_team(r, &key))
}

impl FileManager {
    /// Replace the rows of one team.
    ///
    /// Every row is assigned to `team`; rows without an id get a new one.
    pub async fn update_on_call_team(
        &self,
        team: &str,
        rows: Vec<OnCallRow>,
    ) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_name("team", team)?;

        let team = team.trim().to_string();
        let rows: Vec<OnCallRow> = rows
            .into_iter()
            .map(|mut row| {
                row.team = team.clone();
                if row.id.trim().is_empty() {
                    row.id = uuid::Uuid::new_v4().to_string();
                }
                row
            })
            .collect();
        validate_rows(&rows)?;

        self.run(
            "update_on_call_team",
            |current: &Vec<OnCallRow>| {
                // Ids must stay unique across the whole rota.
                let key = name_key(&team);
                for row in &rows {
                    if current.iter().any(|r| r.id == row.id && !same_team(r, &key)) {
                        return Err(ValidationError::Duplicate {
                            kind: "row id",
                            key: row.id.clone(),
                        }
                        .into());
                    }
                }
                Ok(())
            },
            |current| replace_team_rows(current, &team, &rows),
        )
        .await
    }

    /// Remove every row of `team`.
    pub async fn remove_on_call_team(&self, team: &str) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;

        self.run(
            "remove_on_call_team",
            |rows: &Vec<OnCallRow>| {
                if has_team(rows, team) {
                    Ok(())
                } else {
                    Err(MutationError::not_found("team", team))
                }
            },
            |current| replace_team_rows(current, team, &[]),
        )
        .await
    }

    /// Rename a team in the rota, then on the board.
    ///
    /// The two files are written independently. If the layout write fails
    /// the rows keep the new name and the error is returned.
    pub async fn rename_on_call_team(&self, old: &str, new: &str) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_name("team", new)?;
        let new = new.trim().to_string();
        let same_team_name = name_key(old) == name_key(&new);

        self.run(
            "rename_on_call_team",
            |rows: &Vec<OnCallRow>| {
                if !has_team(rows, old) {
                    return Err(MutationError::not_found("team", old));
                }
                if !same_team_name && has_team(rows, &new) {
                    return Err(ValidationError::Duplicate {
                        kind: "team",
                        key: new.clone(),
                    }
                    .into());
                }
                Ok(())
            },
            |rows| rename_team_rows(rows, old, &new),
        )
        .await?;

        self.run(
            "rename_team_layout",
            |_: &TeamLayout| Ok(()),
            |layout| rename_team_layout(layout, old, &new),
        )
        .await
    }

    /// Put teams in `order` on the board.
    pub async fn reorder_on_call_teams(&self, order: Vec<String>) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;

        let mut seen = Vec::with_capacity(order.len());
        for team in &order {
            let key = name_key(team);
            if seen.contains(&key) {
                return Err(ValidationError::Duplicate {
                    kind: "team",
                    key: team.clone(),
                }
                .into());
            }
            seen.push(key);
        }

        self.run(
            "reorder_on_call_teams",
            |_: &Vec<OnCallRow>| Ok(()),
            |rows| reorder_teams(rows, &order),
        )
        .await
    }

    /// Replace the whole rota.
    pub async fn save_all_on_call(&self, rows: Vec<OnCallRow>) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_rows(&rows)?;

        self.run(
            "save_all_on_call",
            |_: &Vec<OnCallRow>| Ok(()),
            |_| rows.clone(),
        )
        .await
    }

    /// Move one team's card on the board.
    pub async fn update_team_layout(
        &self,
        team: &str,
        position: TeamPosition,
    ) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_name("team", team)?;
        position.validate(team)?;

        let key = name_key(team);
        self.run(
            "update_team_layout",
            |_: &TeamLayout| Ok(()),
            |mut layout: TeamLayout| {
                let stored = layout
                    .keys()
                    .find(|t| name_key(t) == key)
                    .cloned()
                    .unwrap_or_else(|| team.trim().to_string());
                layout.insert(stored, position);
                layout
            },
        )
        .await
    }

    /// Replace the whole board layout.
    pub async fn save_team_layout(&self, layout: TeamLayout) -> Result<(), MutationError> {
        self.admit(OperationClass::Mutation)?;
        validate_layout(&layout)?;

        self.run(
            "save_team_layout",
            |_: &TeamLayout| Ok(()),
            |_| layout.clone(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, team: &str, name: &str) -> OnCallRow {
        OnCallRow::new(id, team, "Primary", name)
    }

    fn rota() -> Vec<OnCallRow> {
        vec![
            row("1", "Ops", "Alice"),
            row("2", "DBA", "Bob"),
            row("3", "Ops", "Carol"),
            row("4", "Network", "Dan"),
        ]
    }

    fn teams(rows: &[OnCallRow]) -> Vec<String> {
        let mut teams: Vec<String> = Vec::new();
        for r in rows {
            if !teams.contains(&r.team) {
                teams.push(r.team.clone());
            }
        }
        teams
    }

    #[test]
    fn test_replace_team_rows_keeps_position() {
        let updated = replace_team_rows(rota(), "ops", &[row("9", "Ops", "Eve")]);

        assert_eq!(teams(&updated), vec!["Ops", "DBA", "Network"]);
        assert_eq!(updated[0].name, "Eve");
        assert_eq!(updated.len(), 3);
    }

    #[test]
    fn test_replace_team_rows_appends_new_team() {
        let updated = replace_team_rows(rota(), "Security", &[row("9", "Security", "Eve")]);
        assert_eq!(teams(&updated), vec!["Ops", "DBA", "Network", "Security"]);
    }

    #[test]
    fn test_replace_with_nothing_removes_team() {
        let updated = replace_team_rows(rota(), "Ops", &[]);
        assert_eq!(teams(&updated), vec!["DBA", "Network"]);
    }

    #[test]
    fn test_rename_team_rows_and_layout() {
        let rows = rename_team_rows(rota(), "OPS", "SRE");
        assert_eq!(teams(&rows), vec!["SRE", "DBA", "Network"]);

        let mut layout = TeamLayout::new();
        layout.insert("Ops".to_string(), TeamPosition::new(1.0, 2.0));
        let layout = rename_team_layout(layout, "ops", "SRE");
        assert_eq!(layout.get("SRE"), Some(&TeamPosition::new(1.0, 2.0)));
        assert!(!layout.contains_key("Ops"));
    }

    #[test]
    fn test_reorder_teams_is_stable() {
        let reordered = reorder_teams(rota(), &["network".to_string(), "Ops".to_string()]);

        assert_eq!(teams(&reordered), vec!["Network", "Ops", "DBA"]);
        let ops: Vec<&str> = reordered
            .iter()
            .filter(|r| r.team == "Ops")
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(ops, vec!["Alice", "Carol"]);
    }

    #[test]
    fn test_validate_rows_rejects_duplicate_ids() {
        let rows = vec![row("1", "Ops", "Alice"), row("1", "Ops", "Bob")];
        assert!(matches!(
            validate_rows(&rows),
            Err(ValidationError::Duplicate { kind: "row id", .. })
        ));
    }

    #[test]
    fn test_validate_layout_rejects_nan() {
        let mut layout = TeamLayout::new();
        layout.insert("Ops".to_string(), TeamPosition::new(f64::NAN, 0.0));
        assert!(matches!(
            validate_layout(&layout),
            Err(ValidationError::InvalidPosition { .. })
        ));
    }
}
