// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Catalog - the archive's bookkeeping store
//!
//! Tracks storage nodes and groups, acquisitions and their files, which node
//! holds (and should hold) which file, and outstanding copy requests. The
//! reconciliation engine consumes the catalog through the [`Store`] trait;
//! two implementations are provided: [`MemoryStore`] for tests and tools,
//! and [`DuckDbStore`] for a persistent single-host catalog.

use thiserror::Error;

mod duck;
mod memory;
pub mod model;
mod store;

pub use duck::DuckDbStore;
pub use memory::MemoryStore;
pub use model::{
    AcqId, AcqName, Acquisition, ArchiveFile, CopyId, FileCopy, FileCopyRequest, FileId, GIB,
    GroupId, HasFile, NewNode, NodeId, RequestId, StorageGroup, StorageKind, StorageNode,
    WantsFile,
};
pub use store::{RequestOrigin, Store, StoreTransaction, WantsFilter, upsert_copy};

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The backing database was unreachable, locked by another process, or
    /// lost a write conflict. Retryable.
    #[error("Catalog connection lost: {0}")]
    ConnectionLost(String),

    #[error("{kind} not found: {what}")]
    NotFound { kind: &'static str, what: String },

    #[error("Duplicate {kind}: {what}")]
    Duplicate { kind: &'static str, what: String },

    #[error("Invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Any other DuckDB failure. Transient DuckDB failures convert to
    /// [`CatalogError::ConnectionLost`] instead.
    #[error("DuckDB error: {0}")]
    DuckDb(duckdb::Error),
}

impl CatalogError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::ConnectionLost(_))
    }

    pub fn not_found(kind: &'static str, what: impl ToString) -> Self {
        CatalogError::NotFound {
            kind,
            what: what.to_string(),
        }
    }

    pub fn duplicate(kind: &'static str, what: impl ToString) -> Self {
        CatalogError::Duplicate {
            kind,
            what: what.to_string(),
        }
    }
}
