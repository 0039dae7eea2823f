//! Dimensional analysis of equations against the units of mapped symbols.

use crate::equation_engine::{BinaryOp, Expr, Function};
use crate::error::{ModelError, Result};
use crate::units::Dimensions;

/// Infers the dimensions of `expr`, failing on the first inconsistent
/// operation. `source` names the equation in error messages.
pub fn infer(
    expr: &Expr,
    source: &str,
    dimensions_of: &impl Fn(&str) -> Dimensions,
) -> Result<Dimensions> {
    let mismatch = |what: String, expected: Dimensions, found: Dimensions| {
        ModelError::DimensionMismatch {
            context: format!("{what} in '{source}'"),
            expected,
            found,
        }
    };

    match expr {
        Expr::Number(_) => Ok(Dimensions::DIMENSIONLESS),
        Expr::Variable(name) => Ok(dimensions_of(name)),
        Expr::Neg(operand) => infer(operand, source, dimensions_of),
        Expr::Binary(left, op, right) => {
            let l = infer(left, source, dimensions_of)?;
            match op {
                BinaryOp::Add | BinaryOp::Sub => {
                    let r = infer(right, source, dimensions_of)?;
                    if l != r && !is_zero(left) && !is_zero(right) {
                        return Err(mismatch(format!("operands of '{expr}'"), l, r));
                    }
                    Ok(if is_zero(left) { r } else { l })
                }
                BinaryOp::Mul | BinaryOp::Div => {
                    let r = infer(right, source, dimensions_of)?;
                    let product = if *op == BinaryOp::Mul {
                        l.multiply(&r)
                    } else {
                        l.divide(&r)
                    };
                    product.ok_or_else(|| {
                        mismatch(format!("exponent overflow in '{expr}'"), l, r)
                    })
                }
                BinaryOp::Pow => {
                    let r = infer(right, source, dimensions_of)?;
                    if !r.is_dimensionless() {
                        return Err(mismatch(
                            format!("exponent of '{expr}'"),
                            Dimensions::DIMENSIONLESS,
                            r,
                        ));
                    }
                    if l.is_dimensionless() {
                        return Ok(l);
                    }
                    right
                        .constant_value()
                        .and_then(|exponent| l.powf(exponent))
                        .ok_or_else(|| {
                            mismatch(
                                format!("non-integral or out-of-range power '{expr}'"),
                                Dimensions::DIMENSIONLESS,
                                l,
                            )
                        })
                }
            }
        }
        Expr::Call(function, arg) => {
            let a = infer(arg, source, dimensions_of)?;
            match function {
                Function::Abs => Ok(a),
                Function::Sqrt => a.powf(0.5).ok_or_else(|| {
                    mismatch(format!("argument of '{expr}'"), Dimensions::DIMENSIONLESS, a)
                }),
                _ if a.is_dimensionless() => Ok(a),
                _ => Err(mismatch(
                    format!("argument of '{expr}'"),
                    Dimensions::DIMENSIONLESS,
                    a,
                )),
            }
        }
    }
}

// A literal zero matches any dimension: `x = 0`.
fn is_zero(expr: &Expr) -> bool {
    matches!(expr, Expr::Number(n) if *n == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;
    use crate::units::Units;

    fn dims(text: &str) -> Dimensions {
        Units::parse(text).unwrap().units.dimensions
    }

    fn lookup(name: &str) -> Dimensions {
        match name {
            "E_g" | "E_d" => dims("eV"),
            "K" | "G" => dims("GPa"),
            "rho" => dims("g/cm^3"),
            "v" => dims("m/s"),
            "T" => dims("K"),
            _ => Dimensions::DIMENSIONLESS,
        }
    }

    fn check(equation: &str) -> Result<Dimensions> {
        infer(&parse(equation).unwrap(), equation, &lookup)
    }

    #[test]
    fn consistent_equations_pass() {
        assert_eq!(check("E_d - E_g*2").unwrap(), dims("eV"));
        assert_eq!(check("v - sqrt(K/rho)").unwrap(), dims("m/s"));
        assert!(check("pugh - K/G").unwrap().is_dimensionless());
        assert_eq!(check("v^2 - K/rho").unwrap(), dims("m^2/s^2"));
        assert!(check("T = 0").is_ok());
    }

    #[test]
    fn mismatched_sum_is_rejected() {
        let err = check("E_d - K").unwrap_err();
        match err {
            ModelError::DimensionMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, dims("eV"));
                assert_eq!(found, dims("GPa"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn transcendental_arguments_must_be_dimensionless() {
        assert!(matches!(
            check("x - exp(T)"),
            Err(ModelError::DimensionMismatch { .. })
        ));
        assert!(check("x - exp(E_g/E_d)").is_ok());
    }

    #[test]
    fn powers_of_dimensioned_bases() {
        assert!(matches!(
            check("x - T^y"),
            Err(ModelError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            check("x - sqrt(T)"),
            Err(ModelError::DimensionMismatch { .. })
        ));
        assert!(check("x - 2^E_g").is_err());
    }

    #[test]
    fn exponent_overflow_is_a_mismatch() {
        assert!(matches!(
            check("x - (v^100)*(v^100)"),
            Err(ModelError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            check("x - v^200"),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }
}
