//! # Data Loading and Validation Module
//!
//! Entry point for the binarized feature tables produced by an upstream preprocessing
//! step. A table is a TSV file with a header row:
//!
//! - one label column (named `label` unless configured otherwise), required for training;
//! - an optional `weights` column with non-negative per-row sample weights;
//! - an optional `sample_id` column, used only to label prediction output;
//! - every other column is a numeric feature. Binarized columns are expected to be named
//!   `attribute=value`, and the part before `=` is recorded as the column's originating
//!   attribute for group sparsity.
//!
//! Failures are assumed to be user-input errors, so `DataError` aims for actionable messages.

use crate::grouping::attribute_of_column;
use ndarray::{Array1, Array2, ShapeBuilder};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_LABEL_COLUMN: &str = "label";
const WEIGHTS_COLUMN: &str = "weights";
const SAMPLE_ID_COLUMN: &str = "sample_id";

/// A binarized feature matrix with its labels and column metadata, ready for training.
#[derive(Debug, Clone)]
pub struct TrainingData {
    /// Shape: [n_samples, n_features].
    pub x: Array2<f64>,
    /// Labels in the `{0, 1}` or `{-1, 1}` encoding.
    pub y: Array1<f64>,
    pub weights: Option<Array1<f64>>,
    pub feature_names: Vec<String>,
    /// Name of the original attribute each column was derived from, when known.
    pub attribute_origins: Option<Vec<String>>,
}

impl TrainingData {
    /// Wraps a matrix and labels, naming the columns `x0, x1, ...`.
    pub fn new(x: Array2<f64>, y: Array1<f64>) -> Self {
        let feature_names = (0..x.ncols()).map(|i| format!("x{i}")).collect();
        Self {
            x,
            y,
            weights: None,
            feature_names,
            attribute_origins: None,
        }
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = names;
        self
    }

    pub fn with_attribute_origins(mut self, origins: Vec<String>) -> Self {
        self.attribute_origins = Some(origins);
        self
    }

    pub fn with_weights(mut self, weights: Array1<f64>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn num_samples(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }
}

/// A feature table read for prediction. Labels are kept when the file has them.
#[derive(Debug)]
pub struct FeatureTable {
    pub x: Array2<f64>,
    pub feature_names: Vec<String>,
    pub labels: Option<Array1<f64>>,
    pub sample_ids: Vec<String>,
}

impl FeatureTable {
    /// Reorders the columns to `names`, failing if any is missing.
    pub fn select_features(&self, names: &[String]) -> Result<Array2<f64>, DataError> {
        let indices = names
            .iter()
            .map(|name| {
                self.feature_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| DataError::ColumnNotFound(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.x.select(ndarray::Axis(1), &indices))
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. The scoring sheet requires complete, preprocessed data."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("The input file contains no data rows.")]
    NoRows,
    #[error("The input file contains no feature columns besides the label, weights and sample ids.")]
    NoFeatureColumns,
}

/// Loads a binarized training table.
pub fn load_training_data(path: &str, label_column: &str) -> Result<TrainingData, DataError> {
    let loaded = internal::load_table(path, Some(label_column), true)?;
    let y = loaded
        .labels
        .ok_or_else(|| DataError::ColumnNotFound(label_column.to_string()))?;
    let origins = loaded
        .feature_names
        .iter()
        .map(|name| attribute_of_column(name).to_string())
        .collect();
    Ok(TrainingData {
        x: loaded.x,
        y,
        weights: loaded.weights,
        feature_names: loaded.feature_names,
        attribute_origins: Some(origins),
    })
}

/// Loads a feature table for prediction. The label column is optional here.
pub fn load_feature_table(path: &str, label_column: &str) -> Result<FeatureTable, DataError> {
    let loaded = internal::load_table(path, Some(label_column), false)?;
    Ok(FeatureTable {
        x: loaded.x,
        feature_names: loaded.feature_names,
        labels: loaded.labels,
        sample_ids: loaded.sample_ids,
    })
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    pub(super) struct LoadedTable {
        pub x: Array2<f64>,
        pub feature_names: Vec<String>,
        pub labels: Option<Array1<f64>>,
        pub weights: Option<Array1<f64>>,
        pub sample_ids: Vec<String>,
    }

    fn validate_is_finite(values: &[f64], column_name: &str) -> Result<(), DataError> {
        if values.iter().any(|&v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(())
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        // A non-numeric string column casts to nulls rather than failing.
        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        validate_is_finite(&values, column_name)?;
        Ok(values)
    }

    fn build_sample_ids(df: &DataFrame, n: usize, present: bool) -> Result<Vec<String>, DataError> {
        if !present {
            return Ok((1..=n).map(|i| i.to_string()).collect());
        }

        let series = df.column(SAMPLE_ID_COLUMN)?;
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let value = series.get(i).unwrap_or(AnyValue::Null);
            ids.push(match value {
                AnyValue::Null => (i + 1).to_string(),
                AnyValue::String(text) => text.to_string(),
                other => other.to_string(),
            });
        }
        Ok(ids)
    }

    pub(super) fn load_table(
        path: &str,
        label_column: Option<&str>,
        require_label: bool,
    ) -> Result<LoadedTable, DataError> {
        log::info!("Loading feature table from '{path}'");

        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let n = df.height();
        if n == 0 {
            return Err(DataError::NoRows);
        }

        let columns: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let has = |name: &str| columns.iter().any(|c| c == name);

        let labels = match label_column {
            Some(name) if has(name) => Some(Array1::from_vec(extract_numeric_column(&df, name)?)),
            Some(name) if require_label => return Err(DataError::ColumnNotFound(name.to_string())),
            _ => None,
        };

        let weights = if has(WEIGHTS_COLUMN) {
            let values = extract_numeric_column(&df, WEIGHTS_COLUMN)?;
            if let Some((row, weight)) = values.iter().enumerate().find(|(_, w)| **w < 0.0) {
                return Err(DataError::ColumnWrongType {
                    column_name: WEIGHTS_COLUMN.to_string(),
                    expected_type: "non-negative f64 values",
                    found_type: format!("negative value {} at row {}", weight, row + 1),
                });
            }
            Some(Array1::from_vec(values))
        } else {
            None
        };

        let sample_ids = build_sample_ids(&df, n, has(SAMPLE_ID_COLUMN))?;

        let feature_names: Vec<String> = columns
            .iter()
            .filter(|c| {
                Some(c.as_str()) != label_column
                    && c.as_str() != WEIGHTS_COLUMN
                    && c.as_str() != SAMPLE_ID_COLUMN
            })
            .cloned()
            .collect();
        if feature_names.is_empty() {
            return Err(DataError::NoFeatureColumns);
        }

        // Column-major buffer, one feature after another.
        let mut buffer = Vec::with_capacity(n * feature_names.len());
        for name in &feature_names {
            buffer.extend(extract_numeric_column(&df, name)?);
        }
        let x = Array2::from_shape_vec((n, feature_names.len()).f(), buffer).map_err(|e| {
            DataError::ColumnWrongType {
                column_name: "<feature matrix>".to_string(),
                expected_type: "rectangular numeric table",
                found_type: e.to_string(),
            }
        })?;

        log::info!(
            "Loaded {} rows with {} feature columns{}",
            n,
            feature_names.len(),
            if weights.is_some() { " and sample weights" } else { "" }
        );

        Ok(LoadedTable {
            x,
            feature_names,
            labels,
            weights,
            sample_ids,
        })
    }
}
