//! Variable-step BDF coefficients
//!
//! For a scheme of order `q` the time derivative at the new level t_{n+1} is
//! approximated by the stencil
//!
//! ```text
//! du/dt(t_{n+1}) ~= alpha_0 * u^{n+1} + sum(alpha_{i+1} * u^{n-i}; i = 0..q-1)
//! ```
//!
//! and the extrapolated value at t_{n+1} by
//!
//! ```text
//! u_extra = sum(beta_i * u^{n-i}; i = 0..q-1)
//! ```
//!
//! Step sizes may change every step under adaptive control, so the
//! coefficients are derived from the interpolating-polynomial conditions on
//! the actual (nonuniform) time levels: a (q+1) x (q+1) linear system in
//! normalized time offsets, solved by dense LU. No fixed-step formula table.
//!
//! `gamma0 = alpha_0 * dt` scales the mass-matrix term of the implicit
//! solve; it reduces to the familiar 1, 3/2, 11/6, 25/12 for uniform steps.

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, TimeIntError};

/// Highest supported BDF order
pub const MAX_ORDER: usize = 4;

/// Immutable per-step BDF coefficient set
///
/// Recomputed by the step controller whenever the step-size history or the
/// effective order changes, cached otherwise. Depends only on step sizes and
/// order, never on field values.
#[derive(Debug, Clone, PartialEq)]
pub struct BdfCoefficients {
    order: usize,
    /// Derivative stencil, length `order + 1`, 1/dt scaling included.
    /// `alpha[0]` weights the (unknown) new level, `alpha[i + 1]` weights
    /// `u^{n-i}`.
    alpha: Vec<f64>,
    /// Extrapolation weights, length `order`
    beta: Vec<f64>,
    /// Mass-matrix scaling of the implicit side, `alpha[0] * dt`
    gamma0: f64,
}

impl BdfCoefficients {
    /// Compute coefficients for the given step-size history and order.
    ///
    /// # Arguments
    /// * `step_sizes` - previous step sizes, most recent first; at least
    ///   `order` entries are used (`step_sizes[0]` is the step being taken)
    /// * `order` - scheme order, 1..=[`MAX_ORDER`]
    pub fn compute(step_sizes: &[f64], order: usize) -> Result<Self> {
        if order == 0 || order > MAX_ORDER {
            return Err(TimeIntError::InvalidOrder {
                order,
                max: MAX_ORDER,
            });
        }
        if step_sizes.len() < order {
            return Err(TimeIntError::InvalidOrder {
                order,
                max: step_sizes.len(),
            });
        }

        let dt0 = step_sizes[0];

        // Normalized offsets of the time levels relative to t_{n+1}:
        // theta[0] = 0 is the new level, theta[i+1] = -(dt_0 + .. + dt_i)/dt_0.
        let mut theta = vec![0.0; order + 1];
        let mut acc = 0.0;
        for i in 0..order {
            acc += step_sizes[i] / dt0;
            theta[i + 1] = -acc;
        }

        // Exactness of the derivative stencil on monomials t^m, m = 0..order:
        // sum(a_k * theta_k^m) = d/dt[t^m](0) = delta_{m,1}.
        let n = order + 1;
        let mut a_matrix = DMatrix::zeros(n, n);
        let mut b_vec = DVector::zeros(n);
        b_vec[1] = 1.0;
        for m in 0..n {
            for k in 0..n {
                a_matrix[(m, k)] = theta[k].powi(m as i32);
            }
        }

        let stencil = a_matrix.lu().solve(&b_vec).ok_or_else(|| {
            TimeIntError::InvalidConfiguration(format!(
                "degenerate step-size history {:?} for BDF order {}",
                &step_sizes[..order],
                order
            ))
        })?;

        let gamma0 = stencil[0];
        let alpha: Vec<f64> = stencil.iter().map(|&a| a / dt0).collect();

        // Extrapolation weights: Lagrange basis of the previous levels
        // evaluated at the new level (theta = 0).
        let mut beta = vec![0.0; order];
        for i in 0..order {
            let ti = theta[i + 1];
            let mut w = 1.0;
            for j in 0..order {
                if j != i {
                    let tj = theta[j + 1];
                    w *= (0.0 - tj) / (ti - tj);
                }
            }
            beta[i] = w;
        }

        Ok(Self {
            order,
            alpha,
            beta,
            gamma0,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Derivative stencil including the 1/dt scaling, length `order + 1`
    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    /// Extrapolation weights, length `order`
    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    /// Mass-matrix scaling factor of the implicit side (dimensionless)
    pub fn gamma0(&self) -> f64 {
        self.gamma0
    }

    /// Apply the derivative stencil to a scalar trajectory sampled at the
    /// stencil's time levels: `values[0]` is the new level, `values[i + 1]`
    /// is `u^{n-i}`.
    pub fn apply_stencil(&self, values: &[f64]) -> f64 {
        self.alpha
            .iter()
            .zip(values.iter())
            .map(|(a, v)| a * v)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_backward_euler() {
        let coeffs = BdfCoefficients::compute(&[0.25], 1).unwrap();
        assert_relative_eq!(coeffs.alpha()[0], 4.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.alpha()[1], -4.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.beta()[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.gamma0(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_uniform_bdf2() {
        let dt = 0.1;
        let coeffs = BdfCoefficients::compute(&[dt, dt], 2).unwrap();
        assert_relative_eq!(coeffs.gamma0(), 1.5, epsilon = 1e-12);
        assert_relative_eq!(coeffs.alpha()[0] * dt, 1.5, epsilon = 1e-12);
        assert_relative_eq!(coeffs.alpha()[1] * dt, -2.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.alpha()[2] * dt, 0.5, epsilon = 1e-12);
        assert_relative_eq!(coeffs.beta()[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.beta()[1], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_uniform_bdf3() {
        let dt = 0.2;
        let coeffs = BdfCoefficients::compute(&[dt, dt, dt], 3).unwrap();
        assert_relative_eq!(coeffs.gamma0(), 11.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.alpha()[1] * dt, -3.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.alpha()[2] * dt, 1.5, epsilon = 1e-12);
        assert_relative_eq!(coeffs.alpha()[3] * dt, -1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.beta()[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.beta()[1], -3.0, epsilon = 1e-12);
        assert_relative_eq!(coeffs.beta()[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_order() {
        assert!(matches!(
            BdfCoefficients::compute(&[0.1], 0),
            Err(TimeIntError::InvalidOrder { order: 0, .. })
        ));
        assert!(matches!(
            BdfCoefficients::compute(&[0.1; 8], 5),
            Err(TimeIntError::InvalidOrder { order: 5, .. })
        ));
        // Too little history for the requested order
        assert!(BdfCoefficients::compute(&[0.1], 2).is_err());
    }

    /// Method-of-exact-solutions check: the stencil differentiates
    /// polynomials of degree <= q exactly, also on nonuniform steps, and the
    /// extrapolation weights reproduce polynomials of degree <= q-1.
    #[test]
    fn test_polynomial_exactness_nonuniform() {
        let histories: [&[f64]; 4] = [
            &[0.1],
            &[0.1, 0.07],
            &[0.1, 0.07, 0.13],
            &[0.1, 0.07, 0.13, 0.05],
        ];

        for (q_minus_1, steps) in histories.iter().enumerate() {
            let q = q_minus_1 + 1;
            let coeffs = BdfCoefficients::compute(steps, q).unwrap();

            // Time levels: t_{n+1} = 0, previous levels at negative offsets
            let mut times = vec![0.0];
            let mut acc = 0.0;
            for &dt in steps.iter().take(q) {
                acc -= dt;
                times.push(acc);
            }

            for degree in 0..=q {
                // u(t) = t^degree, exact derivative at t = 0 is
                // 1 for degree == 1, else 0
                let values: Vec<f64> = times.iter().map(|&t| t.powi(degree as i32)).collect();
                let derivative = coeffs.apply_stencil(&values);
                let exact = if degree == 1 { 1.0 } else { 0.0 };
                assert_relative_eq!(derivative, exact, epsilon = 1e-8, max_relative = 1e-8);

                if degree < q {
                    // Extrapolation from the previous levels to t = 0
                    let extra: f64 = coeffs
                        .beta()
                        .iter()
                        .zip(values.iter().skip(1))
                        .map(|(b, v)| b * v)
                        .sum();
                    let exact_value = if degree == 0 { 1.0 } else { 0.0 };
                    assert_relative_eq!(extra, exact_value, epsilon = 1e-9, max_relative = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_cached_recompute_is_deterministic() {
        let a = BdfCoefficients::compute(&[0.1, 0.2], 2).unwrap();
        let b = BdfCoefficients::compute(&[0.1, 0.2], 2).unwrap();
        assert_eq!(a, b);
    }
}
