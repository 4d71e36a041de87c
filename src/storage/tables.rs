use redb::TableDefinition;

/// File revisions: (file path, revision) -> FileMetadata (msgpack).
/// The composite key gives the per-path revision uniqueness invariant.
pub const FILE_REVISIONS: TableDefinition<(&str, u32), &[u8]> =
    TableDefinition::new("file_revisions");
