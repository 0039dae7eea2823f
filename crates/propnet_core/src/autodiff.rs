use crate::traits::{ResidualSystem, Scalar};
use num_traits::{Num, One, Zero};
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

/// Simple Dual Number for Forward Mode AD
/// val: real part
/// eps: infinitesimal part
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// Chain rule for a scalar function with value `f` and derivative `df`.
    fn chain(self, f: f64, df: f64) -> Self {
        Self::new(f, df * self.eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        Self::new(self.val % rhs.val, self.eps)
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl Scalar for Dual {
    fn from_f64(value: f64) -> Self {
        Self::constant(value)
    }

    fn real(&self) -> f64 {
        self.val
    }

    fn powf(self, exponent: Self) -> Self {
        let value = self.val.powf(exponent.val);
        if exponent.eps == 0.0 {
            // Constant exponent: keeps negative bases with integer powers differentiable.
            let d = if exponent.val == 0.0 {
                0.0
            } else {
                exponent.val * self.val.powf(exponent.val - 1.0)
            };
            return Self::new(value, d * self.eps);
        }
        // x^y = exp(y * ln(x))
        let eps = value * (exponent.eps * self.val.ln() + exponent.val * self.eps / self.val);
        Self::new(value, eps)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }

    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }

    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }

    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }

    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }

    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }

    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }

    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }
}

/// Computes the row-major Jacobian `d r_i / d x_j` of a residual system at `x`.
/// One dual-number pass per unknown.
pub fn jacobian<S>(system: &S, x: &[f64]) -> Vec<f64>
where
    S: ResidualSystem<Dual>,
{
    let cols = system.unknowns();
    let rows = system.residuals();
    let mut jacobian = vec![0.0; rows * cols];
    let mut dual_x = vec![Dual::zero(); cols];
    let mut dual_out = vec![Dual::zero(); rows];

    for j in 0..cols {
        for i in 0..cols {
            dual_x[i] = Dual::new(x[i], if i == j { 1.0 } else { 0.0 });
        }
        system.apply(&dual_x, &mut dual_out);
        for i in 0..rows {
            jacobian[i * cols + j] = dual_out[i].eps;
        }
    }

    jacobian
}
