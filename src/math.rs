
//! Grid arithmetic for three dimensional voxel volumes.

use std::ops::{Add, Sub, Mul, Div};

/// A generic 3-dimensional vector, addressing voxels or blocks.
/// Stored as `(x, y, z)`, with `x` being the fastest varying axis in memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vec3<T> (pub T, pub T, pub T);

impl<T> Vec3<T> {

    /// Only use this function when you are sure that the argument order is correct.
    pub fn new(x: T, y: T, z: T) -> Self { Vec3(x, y, z) }

    /// The first component of this vector.
    pub fn x(self) -> T { self.0 }

    /// The second component of this vector.
    pub fn y(self) -> T { self.1 }

    /// The third component of this vector.
    pub fn z(self) -> T { self.2 }

    /// Apply a function to each component of this vector.
    pub fn map<B>(self, mut mapper: impl FnMut(T) -> B) -> Vec3<B> {
        Vec3(mapper(self.0), mapper(self.1), mapper(self.2))
    }
}

impl Vec3<usize> {

    /// The number of cells in a grid of this size, `x * y * z`.
    pub fn volume(self) -> usize { self.0 * self.1 * self.2 }

    /// Component-wise minimum.
    pub fn min(self, other: Self) -> Self {
        Vec3(self.0.min(other.0), self.1.min(other.1), self.2.min(other.2))
    }
}

impl<T: Add<T>> Add<Vec3<T>> for Vec3<T> {
    type Output = Vec3<T::Output>;
    fn add(self, other: Vec3<T>) -> Self::Output {
        Vec3(self.0 + other.0, self.1 + other.1, self.2 + other.2)
    }
}

impl<T: Sub<T>> Sub<Vec3<T>> for Vec3<T> {
    type Output = Vec3<T::Output>;
    fn sub(self, other: Vec3<T>) -> Self::Output {
        Vec3(self.0 - other.0, self.1 - other.1, self.2 - other.2)
    }
}

impl<T: Mul<T> + Copy> Mul<T> for Vec3<T> {
    type Output = Vec3<T::Output>;
    fn mul(self, factor: T) -> Self::Output {
        Vec3(self.0 * factor, self.1 * factor, self.2 * factor)
    }
}

impl<T: Div<T> + Copy> Div<T> for Vec3<T> {
    type Output = Vec3<T::Output>;
    fn div(self, divisor: T) -> Self::Output {
        Vec3(self.0 / divisor, self.1 / divisor, self.2 / divisor)
    }
}

impl<T> From<(T, T, T)> for Vec3<T> {
    fn from((x, y, z): (T, T, T)) -> Self { Vec3(x, y, z) }
}


/// Whether to round up or down when dividing grid extents.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoundingMode {

    /// Round down, `7 / 2 = 3`.
    Down,

    /// Round up, `7 / 2 = 4`.
    Up,
}

impl RoundingMode {

    /// Integer division with the chosen rounding. Only works for positive numbers.
    pub fn divide(self, dividend: usize, divisor: usize) -> usize {
        match self {
            RoundingMode::Up => (dividend + divisor - 1) / divisor,
            RoundingMode::Down => dividend / divisor,
        }
    }
}

/// The number of blocks required to cover a volume extent.
// round up, because if the volume is not evenly divisible by the blocks,
// another partially used block is added at the end
pub fn compute_block_count(full_res: usize, block_inner: usize) -> usize {
    RoundingMode::Up.divide(full_res, block_inner)
}


#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    fn round_up_division() {
        assert_eq!(RoundingMode::Up.divide(7, 2), 4);
        assert_eq!(RoundingMode::Up.divide(8, 2), 4);
        assert_eq!(RoundingMode::Down.divide(7, 2), 3);
        assert_eq!(compute_block_count(256, 60), 5);
        assert_eq!(compute_block_count(256, 64), 4);
    }

    #[test]
    fn vector_ops() {
        let a = Vec3(1_usize, 2, 3);
        let b = Vec3(4_usize, 5, 6);
        assert_eq!(a + b, Vec3(5, 7, 9));
        assert_eq!(b - a, Vec3(3, 3, 3));
        assert_eq!(a * 2, Vec3(2, 4, 6));
        assert_eq!(b.volume(), 120);
        assert_eq!(a.min(b), a);
    }
}
