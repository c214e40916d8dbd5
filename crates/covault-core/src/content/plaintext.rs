//! Collaborative plain text: a list of characters.

use std::fmt;

use serde_json::Value;

use crate::covalue::DecodedTransaction;
use crate::content::list::CoList;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoPlainText {
    chars: CoList,
}

impl CoPlainText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, tx: &DecodedTransaction) {
        self.chars.apply(tx);
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn as_list(&self) -> &CoList {
        &self.chars
    }

    /// Changes inserting `text` after the character at `index`
    /// (`None` inserts at the very start).
    pub fn insert_after_changes(&self, index: Option<usize>, text: &str) -> Option<Vec<Value>> {
        self.chars
            .insert_many_after_changes(index, text.chars().map(|c| Value::String(c.to_string())))
    }

    /// Changes appending `text` at the end.
    pub fn push_changes(&self, text: &str) -> Option<Vec<Value>> {
        self.insert_after_changes(self.len().checked_sub(1), text)
    }

    /// Changes removing characters in `from..to`.
    pub fn delete_range_changes(&self, from: usize, to: usize) -> Option<Vec<Value>> {
        if from > to || to > self.len() {
            return None;
        }
        (from..to).map(|i| self.chars.delete_change(i)).collect()
    }
}

impl fmt::Display for CoPlainText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.chars.entries() {
            if let Some(s) = entry.value.as_str() {
                f.write_str(s)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SessionId, TransactionId};

    fn apply(text: &mut CoPlainText, index: u32, changes: Vec<Value>) {
        text.apply(&DecodedTransaction {
            id: TransactionId::new(SessionId::from_raw("s"), index),
            made_at: index as i64,
            changes,
            meta: None,
        });
    }

    #[test]
    fn test_insert_and_delete() {
        let mut text = CoPlainText::new();
        let changes = text.push_changes("hello").unwrap();
        apply(&mut text, 0, changes);
        assert_eq!(text.to_string(), "hello");

        let changes = text.push_changes(" world").unwrap();
        apply(&mut text, 1, changes);
        assert_eq!(text.to_string(), "hello world");

        let changes = text.insert_after_changes(Some(4), ",").unwrap();
        apply(&mut text, 2, changes);
        assert_eq!(text.to_string(), "hello, world");

        let changes = text.delete_range_changes(0, 7).unwrap();
        apply(&mut text, 3, changes);
        assert_eq!(text.to_string(), "world");
        assert_eq!(text.len(), 5);
    }

    #[test]
    fn test_bad_range() {
        let text = CoPlainText::new();
        assert!(text.delete_range_changes(0, 1).is_none());
        assert_eq!(text.delete_range_changes(0, 0), Some(vec![]));
    }
}
