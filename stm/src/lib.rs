// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Coherence STM
//!
//! Observable, thread-safe reference cells ("atoms") coordinated by a
//! software transactional memory runtime. Every atom keeps a multi-version
//! chain of its committed values and owns a node in a hierarchical
//! reader/writer lock tree; transactions buffer reads, writes, commutative
//! updates and deferred asynchronous work, then publish everything under a
//! single commit version or roll it all back. Writers are serialized through
//! the lock trees with waits-for deadlock detection; recoverable isolation
//! and deadlock failures rerun the computation within configurable budgets.
//!
//! ```
//! use coherence_stm::{Transaction, TxAtom, TxConfig};
//!
//! let account = TxAtom::new(100i64);
//! let fees = TxAtom::new(0i64);
//!
//! Transaction::run(TxConfig::default(), |_| {
//!     let balance = account.get()?;
//!     account.set(balance - 10)?;
//!     fees.update(|f| f + 10)?;
//!     Ok(())
//! })
//! .expect("transfer");
//!
//! assert_eq!(account.get(), Ok(90));
//! assert_eq!(fees.get(), Ok(10));
//! ```

pub mod asynch;
pub mod atom;
pub mod breaker;
mod chain;
pub mod errors;
pub mod lock;
pub mod promise;
pub mod savepoint;
pub mod transaction;
pub mod version;
pub mod worker;

pub use asynch::{AsyncAtom, AsyncTask, Executor};
pub use atom::{TxAtom, Validator, Watcher};
pub use breaker::BusyBreaker;
pub use errors::{Result, TxError};
pub use lock::{HierLock, LockHandle, LockMode};
pub use promise::{Outcome, TxFuture};
pub use savepoint::SavepointHandle;
pub use transaction::{IsolationLevel, Transaction, TxConfig};
pub use worker::Worker;
