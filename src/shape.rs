//! Shape management for tensors: dimensions, strides, and axis resolution.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("shape error: {0}")]
pub struct ShapeError(pub String);

/// Shape of a tensor: ordered list of dimension sizes, row-major (last axis fastest).
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    pub fn scalar() -> Self {
        Shape { dims: vec![] }
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements. A scalar (rank 0) has size 1.
    pub fn numel(&self) -> usize {
        self.size()
    }

    /// Total number of elements, as named in the spec.
    pub fn size(&self) -> usize {
        if self.dims.is_empty() {
            1
        } else {
            self.dims.iter().product()
        }
    }

    pub fn same_as(&self, other: &Shape) -> bool {
        self.dims == other.dims
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty() || self.size() == 1
    }

    /// Row-major strides for this shape (element count per unit step along each axis).
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Resolve a possibly-negative axis index against this shape's rank.
    pub fn resolve_axis(&self, axis: isize) -> Result<usize, ShapeError> {
        resolve_axis(axis, self.rank())
    }

    /// Last-two-dims row count (for matmul-style layouts). Fails if rank < 2.
    pub fn rows(&self) -> Result<usize, ShapeError> {
        if self.dims.len() < 2 {
            return Err(ShapeError(format!("rows(): rank {} < 2", self.dims.len())));
        }
        Ok(self.dims[self.dims.len() - 2])
    }

    /// Last-two-dims column count. Fails if rank < 2.
    pub fn cols(&self) -> Result<usize, ShapeError> {
        if self.dims.len() < 2 {
            return Err(ShapeError(format!("cols(): rank {} < 2", self.dims.len())));
        }
        Ok(self.dims[self.dims.len() - 1])
    }

    /// Shape with `axis` removed (used by reductions along one axis).
    pub fn without_axis(&self, axis: usize) -> Shape {
        let mut dims = self.dims.clone();
        if axis < dims.len() {
            dims.remove(axis);
        }
        Shape::new(dims)
    }

    /// Shape with `axis` kept but collapsed to size 1 (keepdim reduction).
    pub fn with_axis_one(&self, axis: usize) -> Shape {
        let mut dims = self.dims.clone();
        if axis < dims.len() {
            dims[axis] = 1;
        }
        Shape::new(dims)
    }
}

/// Resolve a possibly-negative axis index against `rank`. Negative axes count from the tail.
pub fn resolve_axis(axis: isize, rank: usize) -> Result<usize, ShapeError> {
    let r = rank as isize;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r {
        return Err(ShapeError(format!("axis {} out of range for rank {}", axis, rank)));
    }
    Ok(a as usize)
}

/// Broadcast two shapes, right-aligned: a size-1 dim may expand to any size, and
/// extra leading dims may be added. Returns the broadcast result shape.
pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Result<Shape, ShapeError> {
    let ad = a.dims();
    let bd = b.dims();
    let rank = ad.len().max(bd.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let av = if i < rank - ad.len() { 1 } else { ad[i - (rank - ad.len())] };
        let bv = if i < rank - bd.len() { 1 } else { bd[i - (rank - bd.len())] };
        if av == bv {
            out[i] = av;
        } else if av == 1 {
            out[i] = bv;
        } else if bv == 1 {
            out[i] = av;
        } else {
            return Err(ShapeError(format!(
                "cannot broadcast {:?} with {:?}",
                ad, bd
            )));
        }
    }
    Ok(Shape::new(out))
}

/// Check that `from` can be broadcast to `to` (right-aligned, size-1 or absent dims only).
pub fn broadcastable_to(from: &Shape, to: &Shape) -> bool {
    let fd = from.dims();
    let td = to.dims();
    if fd.len() > td.len() {
        return false;
    }
    let offset = td.len() - fd.len();
    for i in 0..fd.len() {
        if fd[i] != 1 && fd[i] != td[offset + i] {
            return false;
        }
    }
    true
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape{:?}", self.dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_numel() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.size(), 24);
        assert_eq!(s.rank(), 3);
    }

    #[test]
    fn scalar_shape_has_one_element() {
        let s = Shape::scalar();
        assert_eq!(s.size(), 1);
        assert!(s.is_scalar());
    }

    #[test]
    fn negative_axis_resolves_from_tail() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.resolve_axis(-1).unwrap(), 2);
        assert_eq!(s.resolve_axis(-3).unwrap(), 0);
        assert!(s.resolve_axis(-4).is_err());
    }

    #[test]
    fn broadcast_right_aligned() {
        let a = Shape::new(vec![4, 1, 3]);
        let b = Shape::new(vec![2, 3]);
        let out = broadcast_shapes(&a, &b).unwrap();
        assert_eq!(out.dims(), &[4, 2, 3]);
    }
}
