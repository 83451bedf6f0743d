//! Vector math primitives for similarity calculations.
//!
//! All functions operate on `f32` slices but accumulate in `f64` to bound
//! cancellation error on high-dimensional inputs, casting back to `f32` on
//! return.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{Error, Result};

/// Computes the dot product of two vectors.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the slices differ in length.
pub fn dot(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    Ok(sum as f32)
}

/// Returns the L2 norm (Euclidean magnitude) of a vector.
#[must_use]
pub fn magnitude(v: &[f32]) -> f32 {
    let sum: f64 = v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum();
    sum.sqrt() as f32
}

/// Calculates the cosine similarity between two vectors, in `[-1, 1]`.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the slices differ in length, or
/// [`Error::ZeroVector`] if either input has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    let dot = dot(a, b)?;

    let mag_a = magnitude(a);
    let mag_b = magnitude(b);

    if mag_a == 0.0 || mag_b == 0.0 {
        return Err(Error::ZeroVector);
    }

    Ok((f64::from(dot) / (f64::from(mag_a) * f64::from(mag_b))) as f32)
}

/// Calculates the cosine distance between two vectors, in `[0, 2]`.
///
/// Distance is `1 - similarity`: 0 for identical directions, 2 for
/// opposite directions.
///
/// # Errors
///
/// Propagates the errors of [`cosine_similarity`].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    let similarity = cosine_similarity(a, b)?;
    Ok(1.0 - similarity)
}

/// Calculates the Euclidean distance between two vectors.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if the slices differ in length.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = f64::from(*x) - f64::from(*y);
            diff * diff
        })
        .sum();
    Ok(sum.sqrt() as f32)
}

/// Normalizes a vector in place to unit magnitude.
///
/// # Errors
///
/// Returns [`Error::ZeroVector`] if the vector has zero magnitude.
pub fn normalize(v: &mut [f32]) -> Result<()> {
    let mag = magnitude(v);
    if mag == 0.0 {
        return Err(Error::ZeroVector);
    }

    for x in v.iter_mut() {
        *x /= mag;
    }
    Ok(())
}
