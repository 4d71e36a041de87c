use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::FileMetadata;
use super::tables::*;

impl Database {
    // ========================================================================
    // Revision operations
    // ========================================================================

    /// Insert a new revision row. Fails with `RevisionExists` when the
    /// (file_path, revision) pair is already present -- the backstop for two
    /// concurrent uploads racing to the same next revision.
    pub fn insert_revision(&self, meta: &FileMetadata) -> Result<(), DatabaseError> {
        debug_assert!(!meta.id.is_empty(), "metadata id must not be empty");
        debug_assert!(meta.revision >= 1, "revisions start at 1");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(FILE_REVISIONS)?;
            let key = (meta.file_path.as_str(), meta.revision);

            if table.get(key)?.is_some() {
                return Err(DatabaseError::RevisionExists {
                    file_path: meta.file_path.clone(),
                    revision: meta.revision,
                });
            }

            let data = rmp_serde::to_vec_named(meta)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get the highest-revision row for a path, if any.
    pub fn latest_revision(&self, file_path: &str) -> Result<Option<FileMetadata>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILE_REVISIONS)?;

        match table
            .range((file_path, 0)..=(file_path, u32::MAX))?
            .next_back()
        {
            Some(entry) => {
                let (_, value) = entry?;
                let meta: FileMetadata = rmp_serde::from_slice(value.value())?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Get one specific revision of a path.
    pub fn get_revision(
        &self,
        file_path: &str,
        revision: u32,
    ) -> Result<Option<FileMetadata>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILE_REVISIONS)?;

        match table.get((file_path, revision))? {
            Some(data) => {
                let meta: FileMetadata = rmp_serde::from_slice(data.value())?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List revisions of a path in ascending revision order, optionally
    /// filtered to a single revision.
    pub fn list_revisions(
        &self,
        file_path: &str,
        revision: Option<u32>,
    ) -> Result<Vec<FileMetadata>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILE_REVISIONS)?;

        if let Some(rev) = revision {
            return match table.get((file_path, rev))? {
                Some(data) => Ok(vec![rmp_serde::from_slice(data.value())?]),
                None => Ok(Vec::new()),
            };
        }

        let mut rows = Vec::new();
        for entry in table.range((file_path, 0)..=(file_path, u32::MAX))? {
            let (_, value) = entry?;
            rows.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(rows)
    }

    /// Remove matching revision rows and return them. An empty result means
    /// nothing matched and nothing was changed.
    pub fn remove_revisions(
        &self,
        file_path: &str,
        revision: Option<u32>,
    ) -> Result<Vec<FileMetadata>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(FILE_REVISIONS)?;

            let matched: Vec<FileMetadata> = match revision {
                Some(rev) => match table.get((file_path, rev))? {
                    Some(data) => vec![rmp_serde::from_slice(data.value())?],
                    None => Vec::new(),
                },
                None => {
                    let mut rows = Vec::new();
                    for entry in table.range((file_path, 0)..=(file_path, u32::MAX))? {
                        let (_, value) = entry?;
                        rows.push(rmp_serde::from_slice(value.value())?);
                    }
                    rows
                }
            };

            for meta in &matched {
                table.remove((meta.file_path.as_str(), meta.revision))?;
            }
            matched
        };
        write_txn.commit()?;
        Ok(removed)
    }
}
