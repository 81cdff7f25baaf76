use std::fmt::{Display, Formatter};

/// Owned list of axis lengths, used for shape checks and error reporting.
#[derive(Default, Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Maps a possibly negative axis onto `0..ndim`. Negative axes count
    /// from the end, `-1` being the last one. Returns `None` when out of range.
    pub fn wrap(&self, i: isize) -> Option<usize> {
        let n = self.dims.len() as isize;
        let p = if i < 0 { n + i } else { i };
        (0..n).contains(&p).then_some(p as usize)
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Self {
            dims: value.to_vec(),
        }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

#[cfg(test)]
mod test {
    use crate::ten::Shape;

    #[test]
    fn test_wrap_negative() {
        let s = Shape::from(&[4, 3, 1][..]);
        assert_eq!(s.wrap(-1), Some(2));
        assert_eq!(s.wrap(-3), Some(0));
        assert_eq!(s.wrap(0), Some(0));
        assert_eq!(s.wrap(-4), None);
        assert_eq!(s.wrap(3), None);
        assert_eq!(Shape::default().wrap(-1), None);
    }

    #[test]
    fn test_display() {
        let s = Shape::from(&[5, 1][..]);
        assert_eq!(s.to_string(), "[5, 1]");
        assert_eq!(s.dims(), &[5, 1]);
    }
}
