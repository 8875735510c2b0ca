//! Ordered sequences of owned values, as passed to and returned from calls

use super::{OwnedValue, Value};
use std::ops::Index;

/// Multiple values; out-of-range positions read as `Nil`
///
/// `seq[i]` indexes from 0 like any Rust sequence. [`ValueSeq::get`] takes the 1-based
/// position scripts use for `select` and argument numbers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueSeq {
    values: Vec<OwnedValue>,
}

static NIL: OwnedValue = Value::Nil;

impl ValueSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value at 1-based position `n`
    pub fn get(&self, n: usize) -> &OwnedValue {
        n.checked_sub(1)
            .and_then(|i| self.values.get(i))
            .unwrap_or(&NIL)
    }

    /// First value, or `Nil` when empty
    pub fn first(&self) -> &OwnedValue {
        self.get(1)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: OwnedValue) {
        self.values.push(value);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OwnedValue> {
        self.values.iter()
    }

    pub fn as_slice(&self) -> &[OwnedValue] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<OwnedValue> {
        self.values
    }
}

impl Index<usize> for ValueSeq {
    type Output = OwnedValue;

    fn index(&self, i: usize) -> &OwnedValue {
        self.values.get(i).unwrap_or(&NIL)
    }
}

impl From<Vec<OwnedValue>> for ValueSeq {
    fn from(values: Vec<OwnedValue>) -> Self {
        Self { values }
    }
}

impl FromIterator<OwnedValue> for ValueSeq {
    fn from_iter<I: IntoIterator<Item = OwnedValue>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ValueSeq {
    type Item = OwnedValue;
    type IntoIter = std::vec::IntoIter<OwnedValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'s> IntoIterator for &'s ValueSeq {
    type Item = &'s OwnedValue;
    type IntoIter = std::slice::Iter<'s, OwnedValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_based_get() {
        let seq = ValueSeq::from(vec![Value::from(10), Value::from("b")]);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(1), &Value::from(10));
        assert_eq!(seq.get(2), &Value::from("b"));
        assert_eq!(seq.get(0), &Value::Nil);
        assert_eq!(seq.get(3), &Value::Nil);
    }

    #[test]
    fn test_index_is_zero_based() {
        let seq = ValueSeq::from(vec![Value::from(10), Value::from("b")]);
        assert_eq!(seq[0], Value::from(10));
        assert_eq!(seq[1], Value::from("b"));
        assert_eq!(seq[2], Value::Nil);
        assert_eq!(seq[0], *seq.first());
    }

    #[test]
    fn test_iteration_order() {
        let seq: ValueSeq = (1..=3).map(Value::from).collect();
        let collected: Vec<i64> = seq.iter().filter_map(Value::as_integer).collect();
        assert_eq!(collected, vec![1, 2, 3]);
    }
}
