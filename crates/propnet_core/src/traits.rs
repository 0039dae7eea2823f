use num_traits::Num;
use std::fmt::Debug;
use std::ops::Neg;

/// A trait for types the equation VM can run on.
/// `f64` is used for plain evaluation, `Dual` for exact Jacobians.
pub trait Scalar: Num + Neg<Output = Self> + Copy + Debug + 'static {
    fn from_f64(value: f64) -> Self;

    /// The real (non-infinitesimal) part of the value.
    fn real(&self) -> f64;

    fn powf(self, exponent: Self) -> Self;
    fn sqrt(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn log10(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn sinh(self) -> Self;
    fn cosh(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn real(&self) -> f64 {
        *self
    }

    fn powf(self, exponent: Self) -> Self {
        f64::powf(self, exponent)
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn exp(self) -> Self {
        f64::exp(self)
    }

    fn ln(self) -> Self {
        f64::ln(self)
    }

    fn log10(self) -> Self {
        f64::log10(self)
    }

    fn sin(self) -> Self {
        f64::sin(self)
    }

    fn cos(self) -> Self {
        f64::cos(self)
    }

    fn tan(self) -> Self {
        f64::tan(self)
    }

    fn sinh(self) -> Self {
        f64::sinh(self)
    }

    fn cosh(self) -> Self {
        f64::cosh(self)
    }

    fn tanh(self) -> Self {
        f64::tanh(self)
    }

    fn abs(self) -> Self {
        f64::abs(self)
    }
}

/// A square or overdetermined system of residual equations `r(x) = 0`.
pub trait ResidualSystem<T: Scalar> {
    /// Number of unknowns (length of `x`).
    fn unknowns(&self) -> usize;

    /// Number of residuals (length of `out`).
    fn residuals(&self) -> usize;

    /// Evaluates every residual at `x`.
    /// x: current guess for the unknowns
    /// out: buffer to write the residuals
    fn apply(&self, x: &[T], out: &mut [T]);

    /// Reference magnitude of each residual at `x`, used for relative
    /// convergence tests. Defaults to one (absolute tests).
    fn magnitudes(&self, _x: &[T], out: &mut [T]) {
        for value in out.iter_mut() {
            *value = T::one();
        }
    }
}
