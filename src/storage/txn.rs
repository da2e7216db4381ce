//! Transaction buffer: stages key-value mutations and commits them as one atomic batch.
//!
//! Reads through a [`Transaction`] see the transaction's own uncommitted writes first and fall
//! back to the backend otherwise. Nothing touches disk until [`Transaction::execute`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::storage::backend::{Backend, BackendResult, BatchOp, Partition};

#[derive(Debug, Default)]
pub struct Transaction {
    /// Latest staged value per key; `None` is a staged delete.
    staged: BTreeMap<(Partition, Vec<u8>), Option<Vec<u8>>>,
    /// Staging order, replayed on commit.
    ops: Vec<BatchOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a key, preferring this transaction's staged state.
    pub fn get(
        &self,
        backend: &Backend,
        partition: Partition,
        key: &[u8],
    ) -> BackendResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(partition, key.to_vec())) {
            return Ok(staged.clone());
        }
        backend.get(partition, key)
    }

    pub fn put(&mut self, partition: Partition, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.stage(BatchOp::put(partition, key, value));
    }

    pub fn delete(&mut self, partition: Partition, key: impl Into<Vec<u8>>) {
        self.stage(BatchOp::delete(partition, key));
    }

    /// Stages a list of operations in order.
    pub fn batch(&mut self, ops: impl IntoIterator<Item = BatchOp>) {
        for op in ops {
            self.stage(op);
        }
    }

    fn stage(&mut self, op: BatchOp) {
        self.staged
            .insert((op.partition, op.key.clone()), op.value.clone());
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commits every staged operation in a single atomic backend batch.
    pub fn execute(self, backend: &Backend) -> BackendResult<()> {
        debug!(ops = self.ops.len(), "Executing transaction");
        backend.apply(&self.ops)
    }
}
