use std::fmt::{self, Display};

/// The array shape of a node value.
///
/// Values are stored flat in row-major order. A scalar has rank 0 and a
/// flat length of 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn vector(len: usize) -> Self {
        Shape(vec![len])
    }

    /// Create a shape from its extents.
    ///
    /// Returns `None` if any extent is zero.
    pub fn new(dims: impl Into<Vec<usize>>) -> Option<Self> {
        let dims = dims.into();
        if dims.iter().any(|&d| d == 0) {
            return None;
        }
        Some(Shape(dims))
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_vector(&self) -> bool {
        self.0.len() == 1
    }

    /// Number of elements in a value of this shape.
    pub fn len(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major offset of a multi-index, or `None` if it is out of bounds
    /// or has the wrong number of components.
    pub fn flat_index(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.0.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in index.iter().zip(self.0.iter()) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        Some(offset)
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_scalar() {
            return write!(f, "scalar");
        }
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flat_index_is_row_major() {
        let shape = Shape::new([2, 3]).unwrap();
        assert_eq!(shape.len(), 6);
        assert_eq!(shape.flat_index(&[0, 0]), Some(0));
        assert_eq!(shape.flat_index(&[1, 0]), Some(3));
        assert_eq!(shape.flat_index(&[1, 2]), Some(5));
        assert_eq!(shape.flat_index(&[2, 0]), None);
        assert_eq!(shape.flat_index(&[1]), None);
    }

    #[test]
    fn scalar_shape() {
        let shape = Shape::scalar();
        assert!(shape.is_scalar());
        assert_eq!(shape.len(), 1);
        assert_eq!(shape.flat_index(&[]), Some(0));
        assert_eq!(shape.to_string(), "scalar");
        assert!(Shape::new([3, 0]).is_none());
    }
}
