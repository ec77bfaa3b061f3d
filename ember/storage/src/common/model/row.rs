use serde::{Deserialize, Serialize};

use super::value::Value;

/// One version of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
    /// A deleted row keeps its last values so index keys can be found during cleanup.
    pub is_tombstone: bool,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            is_tombstone: false,
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, column: usize) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    /// Overwrite `columns` with `values` positionally.
    pub fn set_values(&mut self, columns: &[usize], values: &[Value]) {
        for (column, value) in columns.iter().zip(values) {
            if let Some(slot) = self.values.get_mut(*column) {
                *slot = value.clone();
            }
        }
    }

    /// Indices of the columns whose values differ between `self` and `other`.
    pub fn changed_columns(&self, other: &Row) -> Vec<usize> {
        self.values
            .iter()
            .zip(other.values.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect()
    }
}
