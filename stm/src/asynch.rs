// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous atoms.
//!
//! An [`AsyncAtom`] applies its mutations on an injected executor instead of
//! the calling thread. Outside a transaction the task is handed over
//! immediately; inside one it is buffered on the active savepoint and only a
//! successful commit submits it, in FIFO order. Rolling the savepoint back
//! cancels the task's future and the executor never sees it.

use std::sync::{Arc, Mutex};

use crate::{
    errors::Result,
    promise::{self, TxFuture},
    savepoint::AsyncAction,
    transaction,
};

/// A deferred mutation, ready to run on the executor.
pub type AsyncTask = Box<dyn FnOnce() + Send>;

/// The executor contract: receives fully formed tasks, FIFO per atom.
pub type Executor = Arc<dyn Fn(AsyncTask) + Send + Sync>;

struct AsyncInner<T> {
    value: Mutex<T>,
    executor: Executor,
}

/// A mutable cell whose writes run as tasks on an executor.
pub struct AsyncAtom<T> {
    inner: Arc<AsyncInner<T>>,
}

impl<T> Clone for AsyncAtom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncAtom<T> {
    pub fn new(value: T, executor: Executor) -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                value: Mutex::new(value),
                executor,
            }),
        }
    }

    /// Reads the current value; deferred tasks that have not run yet are not
    /// visible.
    pub fn get(&self) -> T {
        self.inner
            .value
            .lock()
            .expect("async atom value poisoned")
            .clone()
    }

    /// Replaces the value on the executor. The future fulfills with the new
    /// value once the task ran.
    pub fn set(&self, value: T) -> Result<TxFuture<T>> {
        self.apply(move |_| value.clone())
    }

    /// Applies `f` on the executor.
    pub fn update<F>(&self, f: F) -> Result<TxFuture<T>>
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        self.apply(f)
    }

    fn apply<F>(&self, f: F) -> Result<TxFuture<T>>
    where
        F: Fn(&T) -> T + Send + 'static,
    {
        let (promise, future) = promise::pair::<T>();
        let inner = self.inner.clone();
        let task_promise = promise.clone();
        let task: AsyncTask = Box::new(move || {
            let mut value = inner.value.lock().expect("async atom value poisoned");
            let next = f(&value);
            *value = next.clone();
            drop(value);
            task_promise.fulfill(next);
        });

        if transaction::is_active() {
            let executor = self.inner.executor.clone();
            transaction::enqueue_async(AsyncAction {
                submit: Box::new(move || executor(task)),
                promise: Box::new(promise),
            })?;
        } else {
            (self.inner.executor)(task);
        }
        Ok(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        transaction::{Transaction, TxConfig},
        TxError,
    };

    // runs tasks synchronously on the caller
    fn inline_executor() -> Executor {
        Arc::new(|task: AsyncTask| task())
    }

    #[test]
    fn test_direct_write_runs_on_executor() {
        let atom = AsyncAtom::new(1usize, inline_executor());
        let future = atom.set(5).expect("set");
        assert_eq!(future.try_value(), Some(5));
        assert_eq!(atom.get(), 5);
    }

    #[test]
    fn test_update_sees_previous_value() {
        let atom = AsyncAtom::new(10usize, inline_executor());
        let future = atom.update(|v| v * 3).expect("update");
        assert_eq!(future.try_value(), Some(30));
        assert_eq!(atom.get(), 30);
    }

    #[test]
    fn test_transactional_write_waits_for_commit() {
        let atom = AsyncAtom::new(0usize, inline_executor());

        let future = Transaction::run(TxConfig::default(), |_| {
            let f = atom.set(9)?;
            assert_eq!(atom.get(), 0, "buffered task must not run before commit");
            assert!(!f.is_settled());
            Ok(f)
        })
        .expect("transaction");

        assert_eq!(future.try_value(), Some(9));
        assert_eq!(atom.get(), 9);
    }

    #[test]
    fn test_rollback_cancels_buffered_tasks() {
        let atom = AsyncAtom::new(3usize, inline_executor());

        let mut held = None;
        let result: crate::Result<()> = Transaction::run(TxConfig::default(), |tx| {
            held = Some(atom.set(4)?);
            Err(tx.rollback())
        });

        assert_eq!(result, Err(TxError::Abort));
        assert_eq!(atom.get(), 3, "cancelled task must never run");
        assert!(held.expect("future handed out").is_cancelled());
    }

    #[test]
    fn test_commit_submits_in_fifo_order() {
        let atom = AsyncAtom::new(0usize, inline_executor());

        let (f1, f2) = Transaction::run(TxConfig::default(), |_| {
            let f1 = atom.update(|v| v + 1)?;
            let f2 = atom.update(|v| v * 10)?;
            Ok((f1, f2))
        })
        .expect("transaction");

        assert_eq!(f1.try_value(), Some(1));
        assert_eq!(f2.try_value(), Some(10));
        assert_eq!(atom.get(), 10);
    }
}
