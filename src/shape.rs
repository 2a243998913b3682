//! Flattening ragged nested lists into one batch and scattering results back.

use crate::error::{FactError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nested<T> {
    Leaf(T),
    List(Vec<Nested<T>>),
}

impl<T> Nested<T> {
    /// Lifts a sequence of sequences into nested form.
    pub fn from_ragged(rows: Vec<Vec<T>>) -> Vec<Self> {
        rows.into_iter()
            .map(|row| Self::List(row.into_iter().map(Self::Leaf).collect()))
            .collect()
    }

    /// All leaves under this node, depth-first.
    pub fn into_leaves(self) -> Vec<T> {
        match self {
            Self::Leaf(v) => vec![v],
            Self::List(items) => items.into_iter().flat_map(Self::into_leaves).collect(),
        }
    }
}

/// Structure of a nested list with the data dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Leaf,
    Node(Vec<Shape>),
}

impl Shape {
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf => 1,
            Self::Node(children) => children.iter().map(Shape::leaf_count).sum(),
        }
    }
}

pub fn flatten<T: Clone>(nested: &[Nested<T>]) -> Vec<T> {
    let mut out = Vec::new();
    for item in nested {
        match item {
            Nested::Leaf(v) => out.push(v.clone()),
            Nested::List(children) => out.extend(flatten(children)),
        }
    }
    out
}

pub fn shape_of<T>(nested: &[Nested<T>]) -> Vec<Shape> {
    nested
        .iter()
        .map(|item| match item {
            Nested::Leaf(_) => Shape::Leaf,
            Nested::List(children) => Shape::Node(shape_of(children)),
        })
        .collect()
}

/// Regroups `flat` one level deep following `shape`: every branch becomes a
/// list of as many leaves as it held before flattening. Surplus trailing
/// elements are ignored.
pub fn restore<T>(flat: Vec<T>, shape: &[Shape]) -> Result<Vec<Nested<T>>> {
    let needed: usize = shape.iter().map(Shape::leaf_count).sum();
    if flat.len() < needed {
        return Err(FactError::ShapeMismatch(format!(
            "restore needs {needed} elements, got {}",
            flat.len()
        )));
    }

    let mut items = flat.into_iter();
    let mut restored = Vec::with_capacity(shape.len());
    for branch in shape {
        match branch {
            Shape::Leaf => restored.extend(items.next().map(Nested::Leaf)),
            Shape::Node(_) => {
                let n = branch.leaf_count();
                restored.push(Nested::List(items.by_ref().take(n).map(Nested::Leaf).collect()));
            }
        }
    }
    Ok(restored)
}

/// Splits `flat` into consecutive chunks of the given lengths.
pub fn split_by_lengths<T>(flat: Vec<T>, lengths: &[usize]) -> Result<Vec<Vec<T>>> {
    let needed: usize = lengths.iter().sum();
    if needed > flat.len() {
        return Err(FactError::ShapeMismatch(format!(
            "cannot split {} elements into chunks {lengths:?}",
            flat.len()
        )));
    }

    let mut items = flat.into_iter();
    Ok(lengths
        .iter()
        .map(|&len| items.by_ref().take(len).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flatten_is_depth_first() {
        let nested = vec![
            Nested::List(vec![
                Nested::Leaf(1),
                Nested::List(vec![Nested::Leaf(2), Nested::Leaf(3)]),
            ]),
            Nested::Leaf(4),
            Nested::List(vec![]),
        ];
        assert_eq!(flatten(&nested), vec![1, 2, 3, 4]);
        assert_eq!(
            shape_of(&nested),
            vec![
                Shape::Node(vec![Shape::Leaf, Shape::Node(vec![Shape::Leaf, Shape::Leaf])]),
                Shape::Leaf,
                Shape::Node(vec![]),
            ]
        );
    }

    #[test]
    fn restore_keeps_empty_rows() {
        let x = Nested::from_ragged(vec![vec!["a"], vec![], vec!["b", "c"]]);
        let restored = restore(flatten(&x), &shape_of(&x)).unwrap();
        assert_eq!(restored, x);
    }

    #[test]
    fn restore_fails_when_flat_is_short() {
        let x = Nested::from_ragged(vec![vec![1, 2], vec![3]]);
        let err = restore(vec![1, 2], &shape_of(&x)).unwrap_err();
        assert!(matches!(err, FactError::ShapeMismatch(_)));
    }

    #[test]
    fn split_by_lengths_checks_total() {
        assert_eq!(
            split_by_lengths(vec![1, 2, 3], &[0, 2, 1]).unwrap(),
            vec![vec![], vec![1, 2], vec![3]]
        );
        assert!(matches!(
            split_by_lengths(vec![1, 2], &[2, 1]),
            Err(FactError::ShapeMismatch(_))
        ));
    }

    proptest! {
        #[test]
        fn restore_inverts_flatten(
            rows in prop::collection::vec(prop::collection::vec(any::<u16>(), 0..6), 0..8)
        ) {
            let x = Nested::from_ragged(rows);
            let restored = restore(flatten(&x), &shape_of(&x)).unwrap();
            prop_assert_eq!(restored, x);
        }
    }
}
