use crate::ten::{Error, ErrorKind};

pub const NEAR_ZERO_TOL: f32 = 1e-3;

/// Succeeds when `|value| < tol`. NaN is never near zero.
pub fn check_near_zero(value: f32, tol: f32) -> Result<(), Error> {
    if value.abs() < tol {
        Ok(())
    } else {
        Err(Box::new(ErrorKind::NotNearZero { value, tol }))
    }
}

/// Test assertion: panics with `Near Zero: {value}` unless `|value| < 1e-3`.
#[track_caller]
pub fn test_near_zero(value: f32) {
    test_near_zero_tol(value, NEAR_ZERO_TOL)
}

#[track_caller]
pub fn test_near_zero_tol(value: f32, tol: f32) {
    if let Err(e) = check_near_zero(value, tol) {
        panic!("{e}");
    }
}
