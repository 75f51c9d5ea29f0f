// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Global result type of the crate.
pub type Result<T> = core::result::Result<T, TxError>;

/// Every failure condition the runtime can surface. Only [`TxError::Isolation`]
/// and [`TxError::Deadlock`] are retried by [`crate::Transaction::run`]; all
/// other variants roll the transaction back and propagate.
#[derive(Debug, Clone, DeriveError, PartialEq, Eq)]
pub enum TxError {
    #[error("new value rejected by the atom validator")]
    Validation,

    #[error("atom was committed past the transaction read version")]
    Isolation,

    #[error("deadlock detected while acquiring a lock")]
    Deadlock,

    #[error("worker was interrupted while blocked")]
    Interrupted,

    #[error("lock acquisition timed out")]
    Timeout,

    #[error("a transaction is already running on this worker")]
    NestedTransaction,

    #[error("lock handle used after release, promotion or demotion")]
    InvalidHandleState,

    #[error("savepoint is not part of the active transaction")]
    InvalidSavepoint,

    #[error("operation requires an active transaction")]
    NoTransaction,

    #[error("future was cancelled by a rollback")]
    Cancelled,

    #[error("transaction aborted")]
    Abort,

    #[error("internal consistency violation ({0})")]
    InternalConsistency(String),

    #[error("inner error occured ({0})")]
    Inner(String),
}
