//! Maps binarized feature columns back to the original attribute they were derived from,
//! so that a sparsity budget can be counted in original attributes instead of dummy columns.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupingError {
    #[error(
        "Grouping by original attribute was requested, but the feature matrix carries no originating-attribute metadata."
    )]
    MissingMetadata,
    #[error("Attribute metadata covers {found} columns, but the feature matrix has {expected}.")]
    LengthMismatch { found: usize, expected: usize },
}

/// Column index → dense group id. Ids are assigned in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMap {
    groups: Vec<usize>,
    num_groups: usize,
}

impl GroupMap {
    pub fn as_slice(&self) -> &[usize] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn group_of(&self, column: usize) -> Option<usize> {
        self.groups.get(column).copied()
    }

    /// Number of distinct groups touched by the given columns.
    pub fn groups_used<I>(&self, columns: I) -> usize
    where
        I: IntoIterator<Item = usize>,
    {
        columns
            .into_iter()
            .filter_map(|c| self.group_of(c))
            .collect::<AHashSet<_>>()
            .len()
    }
}

/// Builds the group map for `num_columns` columns from their originating-attribute names.
pub fn group_features(
    origins: Option<&[String]>,
    num_columns: usize,
) -> Result<GroupMap, GroupingError> {
    let origins = origins.ok_or(GroupingError::MissingMetadata)?;
    if origins.len() != num_columns {
        return Err(GroupingError::LengthMismatch {
            found: origins.len(),
            expected: num_columns,
        });
    }

    let mut ids: AHashMap<&str, usize> = AHashMap::with_capacity(origins.len());
    let groups = origins
        .iter()
        .map(|name| {
            let next = ids.len();
            *ids.entry(name.as_str()).or_insert(next)
        })
        .collect();

    Ok(GroupMap {
        groups,
        num_groups: ids.len(),
    })
}

/// Originating attribute of a binarized column header such as `age=<40`.
/// Headers without `=` name their own attribute.
pub fn attribute_of_column(header: &str) -> &str {
    match header.split_once('=') {
        Some((attribute, _)) => attribute.trim(),
        None => header.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn columns_of_one_attribute_share_a_group() {
        let origins = names(&["age", "age", "sex", "chol", "age", "sex"]);
        let map = group_features(Some(&origins), origins.len()).unwrap();
        assert_eq!(map.as_slice(), &[0, 0, 1, 2, 0, 1]);
        assert_eq!(map.num_groups(), 3);
    }

    #[test]
    fn group_ids_are_dense() {
        let origins = names(&["b", "a", "c", "a"]);
        let map = group_features(Some(&origins), 4).unwrap();
        let mut seen: Vec<usize> = map.as_slice().to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (0..map.num_groups()).collect::<Vec<_>>());
    }

    #[test]
    fn missing_metadata_is_an_error() {
        assert_eq!(
            group_features(None, 3).unwrap_err(),
            GroupingError::MissingMetadata
        );
    }

    #[test]
    fn metadata_must_cover_every_column() {
        let origins = names(&["a", "b"]);
        assert_eq!(
            group_features(Some(&origins), 3).unwrap_err(),
            GroupingError::LengthMismatch {
                found: 2,
                expected: 3
            }
        );
    }

    #[test]
    fn groups_used_counts_distinct_attributes() {
        let origins = names(&["age", "age", "sex", "chol"]);
        let map = group_features(Some(&origins), 4).unwrap();
        assert_eq!(map.groups_used([0, 1]), 1);
        assert_eq!(map.groups_used([0, 2, 3]), 3);
        assert_eq!(map.groups_used(std::iter::empty()), 0);
    }

    #[test]
    fn attribute_is_read_from_header_prefix() {
        assert_eq!(attribute_of_column("age=<40"), "age");
        assert_eq!(attribute_of_column("chest pain=typical"), "chest pain");
        assert_eq!(attribute_of_column("cholesterol"), "cholesterol");
    }
}
