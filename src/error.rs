// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Represents errors that can occur during compaction
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// The compaction was cancelled before it could finish
    ///
    /// Partial outputs have already been cleaned up; the work
    /// can safely be picked and run again later.
    Cancelled,
}

impl Error {
    /// Returns `true` if retrying the same work may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompactionError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Compaction result
pub type Result<T> = std::result::Result<T, Error>;
