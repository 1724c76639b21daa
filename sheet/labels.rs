//! Directional label conversions between the user-facing `{0, 1}` encoding and the
//! `{-1, +1}` encoding the risk-score optimizer works in.
//!
//! The two directions are deliberately separate functions and are not inverses of each
//! other for every input: `to_internal` only rewrites `0`, `from_internal` only rewrites
//! `-1`. A `{-1, 1}` label set therefore passes through `to_internal` untouched, while a
//! `{0, 1}` set passes through `from_internal` untouched.

use ndarray::{Array1, ArrayView1};

/// Maps `0 → -1`, leaving every other value as it is.
pub fn to_internal(labels: ArrayView1<f64>) -> Array1<f64> {
    labels.mapv(|v| if v == 0.0 { -1.0 } else { v })
}

/// Maps `-1 → 0`, leaving every other value as it is.
pub fn from_internal(labels: ArrayView1<f64>) -> Array1<f64> {
    labels.mapv(|v| if v == -1.0 { 0.0 } else { v })
}

/// Returns true when every value is a valid internal label (`-1` or `+1`).
pub fn is_internal_encoding(labels: ArrayView1<f64>) -> bool {
    labels.iter().all(|&v| v == -1.0 || v == 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn zero_one_labels_become_signed() {
        let y = array![0.0, 1.0, 1.0, 0.0];
        assert_eq!(to_internal(y.view()), array![-1.0, 1.0, 1.0, -1.0]);
    }

    #[test]
    fn signed_labels_pass_through_to_internal() {
        let y = array![-1.0, 1.0, -1.0];
        assert_eq!(to_internal(y.view()), y);
    }

    #[test]
    fn signed_labels_map_back_to_zero_one() {
        let y = array![-1.0, 1.0, -1.0];
        assert_eq!(from_internal(y.view()), array![0.0, 1.0, 0.0]);
    }

    #[test]
    fn zero_one_labels_pass_through_from_internal() {
        let y = array![0.0, 1.0];
        assert_eq!(from_internal(y.view()), y);
    }

    #[test]
    fn directions_are_not_a_toggle() {
        // Applying the inbound direction twice must not flip `-1` back to `0`.
        let y = array![0.0, 1.0];
        let once = to_internal(y.view());
        let twice = to_internal(once.view());
        assert_eq!(once, twice);
        assert!(is_internal_encoding(twice.view()));
        assert!(!is_internal_encoding(y.view()));
    }
}
