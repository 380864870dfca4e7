//! Persisted importer and puller progress

use serde::{Deserialize, Serialize};

/// Where the bulk import of one entity kind stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ImportPhase {
    #[default]
    NotStarted,
    /// Fetching window `index`; `cursor` resumes inside it
    ImportingWindow {
        index: usize,
        cursor: Option<String>,
    },
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProgress {
    /// Time the windows are measured back from; fixed when the import starts
    pub anchor_ms: Option<i64>,
    #[serde(flatten)]
    pub phase: ImportPhase,
    /// Records applied so far
    pub imported: u64,
    /// Windows given up after a page fetch timed out
    #[serde(default)]
    pub abandoned_windows: Vec<usize>,
}

impl ImportProgress {
    pub const fn is_completed(&self) -> bool {
        matches!(self.phase, ImportPhase::Completed)
    }
}

/// Incremental pull position for one entity kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullCursor {
    /// Records edited at or after this time (minus the overlap) are fetched
    pub since: i64,
    /// Resume position inside an interrupted pull
    pub cursor: Option<String>,
    /// Newest `last_edited` seen in the current pull
    pub high_water: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn import_progress_flattens_phase() {
        let progress = ImportProgress {
            anchor_ms: Some(1_000),
            phase: ImportPhase::ImportingWindow {
                index: 2,
                cursor: Some("c".into()),
            },
            imported: 7,
            abandoned_windows: vec![1],
        };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["phase"], json!("importing_window"));
        assert_eq!(value["index"], json!(2));

        let back: ImportProgress = serde_json::from_value(value).unwrap();
        assert_eq!(back, progress);
    }
}
