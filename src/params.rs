// --- Parameter-Shaped Vectors ---
// Flattening order is parameter order, row-major inside each tensor.

use crate::autograd::Tensor;
use crate::error::{FedError, Result};
use crate::simd::{add_scaled_row, dot_product, vector_scale};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamVec {
    shapes: Vec<Vec<usize>>,
    values: Vec<Vec<f64>>,
}

pub type GradientVector = ParamVec;

impl ParamVec {
    pub fn new(shapes: Vec<Vec<usize>>, values: Vec<Vec<f64>>) -> Result<Self> {
        if shapes.len() != values.len() {
            return Err(FedError::TensorCountMismatch {
                expected: shapes.len(),
                actual: values.len(),
            });
        }
        for (index, (shape, v)) in shapes.iter().zip(values.iter()).enumerate() {
            if shape.iter().product::<usize>() != v.len() {
                return Err(FedError::StructuralMismatch {
                    index,
                    expected: shape.clone(),
                    actual: vec![v.len()],
                });
            }
        }
        Ok(ParamVec { shapes, values })
    }

    pub fn zeros(shapes: &[Vec<usize>]) -> Self {
        ParamVec {
            shapes: shapes.to_vec(),
            values: shapes.iter().map(|s| vec![0.0; s.iter().product()]).collect(),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(&self.shapes)
    }

    pub fn from_tensors(tensors: &[Tensor]) -> Self {
        ParamVec {
            shapes: tensors.iter().map(|t| t.shape.clone()).collect(),
            values: tensors.iter().map(|t| t.values()).collect(),
        }
    }

    pub fn from_grads(tensors: &[Tensor]) -> Self {
        ParamVec {
            shapes: tensors.iter().map(|t| t.shape.clone()).collect(),
            values: tensors.iter().map(|t| t.grad_values()).collect(),
        }
    }

    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    pub fn tensors(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn tensor_mut(&mut self, index: usize) -> &mut [f64] {
        &mut self.values[index]
    }

    pub fn num_tensors(&self) -> usize {
        self.values.len()
    }

    pub fn dim(&self) -> usize {
        self.values.iter().map(|v| v.len()).sum()
    }

    pub fn flatten(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.dim());
        for v in &self.values {
            flat.extend_from_slice(v);
        }
        flat
    }

    pub fn check_compatible(&self, other: &ParamVec) -> Result<()> {
        if self.shapes.len() != other.shapes.len() {
            return Err(FedError::TensorCountMismatch {
                expected: self.shapes.len(),
                actual: other.shapes.len(),
            });
        }
        for (index, (a, b)) in self.shapes.iter().zip(other.shapes.iter()).enumerate() {
            if a != b {
                return Err(FedError::StructuralMismatch {
                    index,
                    expected: a.clone(),
                    actual: b.clone(),
                });
            }
        }
        Ok(())
    }

    /// self += scale * other
    pub fn add_scaled(&mut self, other: &ParamVec, scale: f64) -> Result<()> {
        self.check_compatible(other)?;
        for (dst, src) in self.values.iter_mut().zip(other.values.iter()) {
            add_scaled_row(dst, src, scale);
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        for v in self.values.iter_mut() {
            vector_scale(v, factor);
        }
    }

    pub fn norm(&self) -> f64 {
        self.values.iter().map(|v| dot_product(v, v)).sum::<f64>().sqrt()
    }

    pub fn distance(&self, other: &ParamVec) -> Result<f64> {
        let mut diff = self.clone();
        diff.add_scaled(other, -1.0)?;
        Ok(diff.norm())
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.iter().all(|x| x.is_finite()))
    }

    pub fn mean<'a, I>(items: I) -> Result<ParamVec>
    where
        I: IntoIterator<Item = &'a ParamVec>,
    {
        let mut iter = items.into_iter();
        let first = iter.next().ok_or(FedError::EmptyFederation)?;
        let mut acc = first.clone();
        let mut count = 1usize;
        for item in iter {
            acc.add_scaled(item, 1.0)?;
            count += 1;
        }
        acc.scale(1.0 / count as f64);
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamVec {
        ParamVec::new(vec![vec![2, 2], vec![3]], vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0]]).unwrap()
    }

    #[test]
    fn new_rejects_bad_lengths() {
        let err = ParamVec::new(vec![vec![2, 2]], vec![vec![1.0, 2.0, 3.0]]);
        assert!(matches!(err, Err(FedError::StructuralMismatch { .. })));
    }

    #[test]
    fn flatten_concatenates_in_tensor_order() {
        let p = sample();
        assert_eq!(p.flatten(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(p.dim(), 7);
    }

    #[test]
    fn shape_mismatch_is_structural_error() {
        let p = sample();
        let q = ParamVec::new(vec![vec![4], vec![3]], vec![vec![0.0; 4], vec![0.0; 3]]).unwrap();
        match p.check_compatible(&q) {
            Err(FedError::StructuralMismatch { index, .. }) => assert_eq!(index, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mean_of_two() {
        let a = sample();
        let mut b = sample();
        b.scale(3.0);
        let m = ParamVec::mean([&a, &b]).unwrap();
        let mut expected = sample();
        expected.scale(2.0);
        assert_eq!(m, expected);
    }

    #[test]
    fn mean_of_nothing_is_error() {
        let empty: Vec<ParamVec> = Vec::new();
        assert!(ParamVec::mean(&empty).is_err());
    }

    #[test]
    fn distance_is_euclidean() {
        let a = sample();
        let b = a.zeros_like();
        let expected = (1.0f64 + 4.0 + 9.0 + 16.0 + 25.0 + 36.0 + 49.0).sqrt();
        assert!((a.distance(&b).unwrap() - expected).abs() < 1e-12);
    }
}
