#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled")]
    Sled(#[from] sled::Error),
    #[error("i/o on `{path}`")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "the last flush did not complete (flush id {0}); the database is possibly corrupted"
    )]
    DirtyFlush(u64),
    #[error("corrupted record in table `{table}`: {reason}")]
    Corrupted { table: String, reason: String },
}

impl StoreError {
    pub fn corrupted(table: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupted {
            table: table.into(),
            reason: reason.to_string(),
        }
    }
}
