//! Cartesian expansion of named parameter ranges into variants.

use crate::constraint::Constraint;
use stratlab_core::{EngineError, ParamValue, ParameterRange, Variant};
use tracing::debug;

/// A validated search space.
///
/// Iteration is lazy and restartable: every call to [`iter`](Self::iter)
/// yields the same variants in the same order. The first declared parameter
/// is the outermost loop, and each parameter's values ascend.
#[derive(Debug, Clone)]
pub struct ParameterGrid {
    names: Vec<String>,
    values: Vec<Vec<ParamValue>>,
    constraint: Option<Constraint>,
    total_variants: usize,
}

impl ParameterGrid {
    /// Validates the ranges, parses the constraint, and computes the
    /// Cartesian product size.
    ///
    /// # Errors
    /// - `EmptyGrid` when `ranges` is empty
    /// - `InvalidRange` for a bad range or a duplicate/blank name
    /// - `GridTooLarge` when the product exceeds `max_variants`
    /// - `InvalidConstraint` when the constraint does not parse
    pub fn build(
        ranges: &[(String, ParameterRange)],
        constraint: Option<&str>,
        max_variants: usize,
    ) -> Result<Self, EngineError> {
        if ranges.is_empty() {
            return Err(EngineError::EmptyGrid);
        }

        let mut names: Vec<String> = Vec::with_capacity(ranges.len());
        let mut total: u128 = 1;
        for (name, range) in ranges {
            if name.trim().is_empty() {
                return Err(EngineError::InvalidRange {
                    name: name.clone(),
                    reason: "parameter name must not be blank".to_string(),
                });
            }
            if names.contains(name) {
                return Err(EngineError::InvalidRange {
                    name: name.clone(),
                    reason: "parameter declared more than once".to_string(),
                });
            }
            range.validate(name)?;
            total = total.saturating_mul(range.count() as u128);
            names.push(name.clone());
        }

        if total > max_variants as u128 {
            return Err(EngineError::GridTooLarge {
                total,
                limit: max_variants,
            });
        }

        let constraint = constraint
            .map(str::trim)
            .filter(|source| !source.is_empty())
            .map(|source| Constraint::parse(source, &names))
            .transpose()?;

        let values: Vec<Vec<ParamValue>> = ranges.iter().map(|(_, r)| r.values()).collect();
        // values() may drop float duplicates after rounding
        let total_variants: usize = values.iter().map(Vec::len).product();

        debug!(
            parameters = names.len(),
            total_variants,
            constrained = constraint.is_some(),
            "Built parameter grid"
        );

        Ok(Self {
            names,
            values,
            constraint,
            total_variants,
        })
    }

    /// Size of the unfiltered Cartesian product.
    #[must_use]
    pub const fn total_variants(&self) -> usize {
        self.total_variants
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub const fn constraint(&self) -> Option<&Constraint> {
        self.constraint.as_ref()
    }

    #[must_use]
    pub fn iter(&self) -> GridIter<'_> {
        GridIter {
            grid: self,
            cursor: vec![0; self.values.len()],
            exhausted: self.values.iter().any(Vec::is_empty),
        }
    }

    /// All variants that pass the constraint.
    #[must_use]
    pub fn expand(&self) -> Vec<Variant> {
        self.iter().collect()
    }

    /// Number of variants that pass the constraint.
    #[must_use]
    pub fn filtered_len(&self) -> usize {
        self.iter().count()
    }
}

impl<'a> IntoIterator for &'a ParameterGrid {
    type Item = Variant;
    type IntoIter = GridIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Odometer over the grid's value lists, last parameter fastest.
pub struct GridIter<'a> {
    grid: &'a ParameterGrid,
    cursor: Vec<usize>,
    exhausted: bool,
}

impl GridIter<'_> {
    fn current(&self) -> Vec<ParamValue> {
        self.cursor
            .iter()
            .zip(&self.grid.values)
            .map(|(&i, values)| values[i])
            .collect()
    }

    fn step(&mut self) {
        for position in (0..self.cursor.len()).rev() {
            self.cursor[position] += 1;
            if self.cursor[position] < self.grid.values[position].len() {
                return;
            }
            self.cursor[position] = 0;
        }
        self.exhausted = true;
    }
}

impl Iterator for GridIter<'_> {
    type Item = Variant;

    fn next(&mut self) -> Option<Variant> {
        while !self.exhausted {
            let candidate = self.current();
            self.step();

            let accepted = self
                .grid
                .constraint
                .as_ref()
                .map_or(true, |c| c.accepts(&candidate));
            if accepted {
                let entries = self.grid.names.iter().cloned().zip(candidate).collect();
                return Some(Variant::new(entries));
            }
        }
        None
    }
}

/// Expands `ranges` with no size ceiling.
///
/// # Errors
/// See [`ParameterGrid::build`].
pub fn expand(
    ranges: &[(String, ParameterRange)],
    constraint: Option<&str>,
) -> Result<Vec<Variant>, EngineError> {
    ParameterGrid::build(ranges, constraint, usize::MAX).map(|grid| grid.expand())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: f64, stop: f64, step: f64) -> ParameterRange {
        ParameterRange::new(start, stop, step)
    }

    fn ranges(pairs: &[(&str, ParameterRange)]) -> Vec<(String, ParameterRange)> {
        pairs.iter().map(|(n, r)| ((*n).to_string(), *r)).collect()
    }

    fn ints(variant: &Variant) -> Vec<i64> {
        variant
            .iter()
            .map(|(_, v)| match v {
                ParamValue::Int(i) => i,
                ParamValue::Float(f) => panic!("expected integer, got {f}"),
            })
            .collect()
    }

    // ============================================
    // Expansion order and contents
    // ============================================

    #[test]
    fn single_range_expands_to_its_values() {
        let variants = expand(&ranges(&[("period", range(5.0, 20.0, 5.0))]), None).unwrap();
        let values: Vec<Vec<i64>> = variants.iter().map(ints).collect();
        assert_eq!(values, vec![vec![5], vec![10], vec![15], vec![20]]);
    }

    #[test]
    fn constrained_two_parameter_grid() {
        let spec = ranges(&[("fast", range(1.0, 3.0, 1.0)), ("slow", range(2.0, 4.0, 1.0))]);
        let grid = ParameterGrid::build(&spec, Some("fast < slow"), 100).unwrap();

        assert_eq!(grid.total_variants(), 9);
        let values: Vec<Vec<i64>> = grid.iter().map(|v| ints(&v)).collect();
        assert_eq!(
            values,
            vec![
                vec![1, 2],
                vec![1, 3],
                vec![1, 4],
                vec![2, 3],
                vec![2, 4],
                vec![3, 4]
            ]
        );
        assert_eq!(grid.filtered_len(), 6);
    }

    #[test]
    fn first_declared_parameter_is_outermost() {
        let spec = ranges(&[("slow", range(10.0, 20.0, 10.0)), ("fast", range(1.0, 2.0, 1.0))]);
        let variants = expand(&spec, None).unwrap();
        let values: Vec<Vec<i64>> = variants.iter().map(ints).collect();
        assert_eq!(values, vec![vec![10, 1], vec![10, 2], vec![20, 1], vec![20, 2]]);
        let names: Vec<&str> = variants[0].iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["slow", "fast"]);
    }

    #[test]
    fn iteration_is_restartable() {
        let spec = ranges(&[("a", range(0.0, 1.0, 0.25)), ("b", range(1.0, 3.0, 1.0))]);
        let grid = ParameterGrid::build(&spec, Some("a * b < 2"), 1000).unwrap();
        let first: Vec<Variant> = grid.iter().collect();
        let second: Vec<Variant> = (&grid).into_iter().collect();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn constraint_output_is_subset_of_unconstrained() {
        let spec = ranges(&[("a", range(1.0, 6.0, 1.0)), ("b", range(1.0, 6.0, 1.0))]);
        let all = expand(&spec, None).unwrap();
        for constraint in ["a < b", "a % 2 == 0 or b == 3", "a + b > 20", "true"] {
            let filtered = expand(&spec, Some(constraint)).unwrap();
            assert!(filtered.iter().all(|v| all.contains(v)), "{constraint}");
        }
    }

    #[test]
    fn constraint_may_filter_everything() {
        let spec = ranges(&[("a", range(1.0, 3.0, 1.0))]);
        let grid = ParameterGrid::build(&spec, Some("a > 10"), 100).unwrap();
        assert_eq!(grid.total_variants(), 3);
        assert_eq!(grid.iter().next(), None);
    }

    #[test]
    fn blank_constraint_is_ignored() {
        let spec = ranges(&[("a", range(1.0, 3.0, 1.0))]);
        let grid = ParameterGrid::build(&spec, Some("  "), 100).unwrap();
        assert!(grid.constraint().is_none());
        assert_eq!(grid.filtered_len(), 3);
    }

    // ============================================
    // Build-time validation
    // ============================================

    #[test]
    fn empty_ranges_fail() {
        assert_eq!(expand(&[], None).unwrap_err(), EngineError::EmptyGrid);
    }

    #[test]
    fn invalid_range_fails() {
        let spec = ranges(&[("a", range(1.0, 3.0, 1.0)), ("b", range(3.0, 1.0, 1.0))]);
        let err = expand(&spec, None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { ref name, .. } if name == "b"));
    }

    #[test]
    fn duplicate_names_fail() {
        let spec = ranges(&[("a", range(1.0, 3.0, 1.0)), ("a", range(1.0, 3.0, 1.0))]);
        assert!(matches!(
            expand(&spec, None).unwrap_err(),
            EngineError::InvalidRange { .. }
        ));
    }

    #[test]
    fn oversized_grid_is_rejected_before_expansion() {
        let spec = ranges(&[
            ("a", range(1.0, 1000.0, 1.0)),
            ("b", range(1.0, 1000.0, 1.0)),
        ]);
        let err = ParameterGrid::build(&spec, None, 100_000).unwrap_err();
        assert_eq!(
            err,
            EngineError::GridTooLarge {
                total: 1_000_000,
                limit: 100_000
            }
        );
    }

    #[test]
    fn malformed_constraint_fails_at_build() {
        let spec = ranges(&[("a", range(1.0, 3.0, 1.0))]);
        let err = ParameterGrid::build(&spec, Some("a <"), 100).unwrap_err();
        assert_eq!(err.code(), "invalid_constraint");
    }

    #[test]
    fn deeply_nested_constraint_fails_at_build() {
        let spec = ranges(&[("a", range(1.0, 3.0, 1.0))]);
        for depth in [100, 20_000] {
            let source = format!("{}a > 0{}", "(".repeat(depth), ")".repeat(depth));
            let err = ParameterGrid::build(&spec, Some(&source), 100).unwrap_err();
            assert_eq!(err.code(), "invalid_constraint");
        }
    }
}
