//! Entity kinds and the schema that parameterizes the record repository

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of records kept in sync with the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Project,
    TimeEntry,
    Note,
}

impl EntityKind {
    /// All kinds, in the order the importer and puller visit them.
    pub const ALL: [Self; 4] = [Self::Project, Self::Task, Self::TimeEntry, Self::Note];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::TimeEntry => "time_entry",
            Self::Note => "note",
        }
    }

    /// The schema describing this kind's table and indexed fields.
    pub const fn schema(self) -> &'static EntitySchema {
        match self {
            Self::Task => &TASK_SCHEMA,
            Self::Project => &PROJECT_SCHEMA,
            Self::TimeEntry => &TIME_ENTRY_SCHEMA,
            Self::Note => &NOTE_SCHEMA,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" | "tasks" => Ok(Self::Task),
            "project" | "projects" => Ok(Self::Project),
            "time_entry" | "time-entry" | "time_entries" | "time-entries" => Ok(Self::TimeEntry),
            "note" | "notes" => Ok(Self::Note),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Static description of one entity kind.
///
/// The repository is written once against this description; the field names
/// decide which JSON attributes are copied into the indexed key columns used
/// by listing filters.
#[derive(Debug, PartialEq, Eq)]
pub struct EntitySchema {
    pub kind: EntityKind,
    /// SQLite table holding this kind's records
    pub table: &'static str,
    /// Field shown as the record's title
    pub title_field: &'static str,
    /// Field holding a workflow status (e.g. "todo", "done")
    pub status_field: Option<&'static str>,
    /// Field holding the record's primary date
    pub date_field: Option<&'static str>,
    /// Boolean field exposed as a listing flag
    pub flag_field: Option<&'static str>,
    /// Field holding the remote id of a related record
    pub relation_field: Option<&'static str>,
}

pub static TASK_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Task,
    table: "tasks",
    title_field: "title",
    status_field: Some("status"),
    date_field: Some("due"),
    flag_field: Some("completed"),
    relation_field: Some("project"),
};

pub static PROJECT_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Project,
    table: "projects",
    title_field: "name",
    status_field: Some("status"),
    date_field: Some("deadline"),
    flag_field: Some("archived"),
    relation_field: None,
};

pub static TIME_ENTRY_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::TimeEntry,
    table: "time_entries",
    title_field: "description",
    status_field: None,
    date_field: Some("start"),
    flag_field: Some("billable"),
    relation_field: Some("task"),
};

pub static NOTE_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Note,
    table: "notes",
    title_field: "title",
    status_field: None,
    date_field: Some("date"),
    flag_field: Some("pinned"),
    relation_field: Some("project"),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_parses_aliases() {
        assert_eq!("tasks".parse::<EntityKind>(), Ok(EntityKind::Task));
        assert_eq!("Time-Entry".parse::<EntityKind>(), Ok(EntityKind::TimeEntry));
        assert!("invoice".parse::<EntityKind>().is_err());
    }

    #[test]
    fn every_kind_has_its_own_table() {
        let mut tables = EntityKind::ALL
            .iter()
            .map(|kind| kind.schema().table)
            .collect::<Vec<_>>();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            assert_eq!(kind.schema().kind, kind);
        }
    }
}
