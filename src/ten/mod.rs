pub mod check;
pub mod ops;
pub mod shape;

pub use check::*;
pub use ops::*;
pub use shape::*;

use ndarray::ArrayD;

/// Dense `f32` tensor with a dimensionality only known at runtime.
pub type Tensor = ArrayD<f32>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("Wrong shape: {got} expected: {expected}")]
    WrongShape { expected: Shape, got: Shape },
    #[error("Empty tensor")]
    Empty,
    #[error("Near Zero: {value}")]
    NotNearZero { value: f32, tol: f32 },
}

pub type Error = Box<ErrorKind>;

impl ErrorKind {
    pub(crate) fn wrong_shape(expected: impl Into<Shape>, got: impl Into<Shape>) -> Error {
        Box::new(ErrorKind::WrongShape {
            expected: expected.into(),
            got: got.into(),
        })
    }
}
