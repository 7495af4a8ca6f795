use faer::linalg::solvers::Solve;
use faer::{Mat, MatRef};
use ndarray::{Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinalgError {
    #[error("matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("dimension mismatch: left operand has {left} rows, right operand has {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("matrix contains non-finite entries")]
    NonFiniteInput,
    #[error("linear solve produced non-finite entries; the system is singular or ill-conditioned")]
    NonFiniteSolution,
}

fn array_to_mat<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    let (rows, cols) = array.dim();
    Mat::from_fn(rows, cols, |i, j| array[(i, j)])
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Solves `A X = B` with a partially pivoted LU factorisation.
pub fn solve<S, T>(a: &ArrayBase<S, Ix2>, b: &ArrayBase<T, Ix2>) -> Result<Array2<f64>, LinalgError>
where
    S: Data<Elem = f64>,
    T: Data<Elem = f64>,
{
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { rows, cols });
    }
    if b.nrows() != rows {
        return Err(LinalgError::DimensionMismatch {
            left: rows,
            right: b.nrows(),
        });
    }
    let a_mat = array_to_mat(a);
    let b_mat = array_to_mat(b);
    let lu = a_mat.as_ref().partial_piv_lu();
    let solution = mat_to_array(lu.solve(b_mat.as_ref()).as_ref());
    if solution.iter().all(|v| v.is_finite()) {
        Ok(solution)
    } else {
        Err(LinalgError::NonFiniteSolution)
    }
}

/// Induced 1-norm (largest absolute column sum).
pub fn one_norm<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> f64 {
    a.columns()
        .into_iter()
        .map(|col| col.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

// Padé coefficients b_0..b_m for the diagonal approximants of degree 3, 5, 7, 9 and 13,
// with the 1-norm thresholds below which each degree meets double precision (Higham 2005).
const PADE_3: [f64; 4] = [120.0, 60.0, 12.0, 1.0];
const PADE_5: [f64; 6] = [30240.0, 15120.0, 3360.0, 420.0, 30.0, 1.0];
const PADE_7: [f64; 8] = [
    17297280.0, 8648640.0, 1995840.0, 277200.0, 25200.0, 1512.0, 56.0, 1.0,
];
const PADE_9: [f64; 10] = [
    17643225600.0,
    8821612800.0,
    2075673600.0,
    302702400.0,
    30270240.0,
    2162160.0,
    110880.0,
    3960.0,
    90.0,
    1.0,
];
const PADE_13: [f64; 14] = [
    64764752532480000.0,
    32382376266240000.0,
    7771770303897600.0,
    1187353796428800.0,
    129060195264000.0,
    10559470521600.0,
    670442572800.0,
    33522128640.0,
    1323241920.0,
    40840800.0,
    960960.0,
    16380.0,
    182.0,
    1.0,
];
const THETA_3: f64 = 1.495585217958292e-2;
const THETA_5: f64 = 2.539398330063230e-1;
const THETA_7: f64 = 9.504178996162932e-1;
const THETA_9: f64 = 2.097847961257068;
const THETA_13: f64 = 5.371920351148152;

fn pade_low_degree(a: &Array2<f64>, coefficients: &[f64]) -> Result<Array2<f64>, LinalgError> {
    let n = a.nrows();
    let a2 = a.dot(a);
    let mut power = Array2::<f64>::eye(n);
    let mut odd = Array2::<f64>::zeros((n, n));
    let mut even = Array2::<f64>::zeros((n, n));
    for pair in coefficients.chunks(2) {
        even.scaled_add(pair[0], &power);
        if let Some(&b_odd) = pair.get(1) {
            odd.scaled_add(b_odd, &power);
        }
        power = power.dot(&a2);
    }
    let u = a.dot(&odd);
    solve(&(&even - &u), &(&even + &u))
}

fn pade_13(a: &Array2<f64>) -> Result<Array2<f64>, LinalgError> {
    let b = &PADE_13;
    let n = a.nrows();
    let identity = Array2::<f64>::eye(n);
    let a2 = a.dot(a);
    let a4 = a2.dot(&a2);
    let a6 = a4.dot(&a2);

    let inner_u = &a6 * b[13] + &a4 * b[11] + &a2 * b[9];
    let u_poly = a6.dot(&inner_u) + &a6 * b[7] + &a4 * b[5] + &a2 * b[3] + &identity * b[1];
    let u = a.dot(&u_poly);

    let inner_v = &a6 * b[12] + &a4 * b[10] + &a2 * b[8];
    let v = a6.dot(&inner_v) + &a6 * b[6] + &a4 * b[4] + &a2 * b[2] + &identity * b[0];

    solve(&(&v - &u), &(&v + &u))
}

/// Matrix exponential by scaling and squaring with diagonal Padé approximants.
///
/// The degree is chosen from the 1-norm of `a`; only when even degree 13 would be inaccurate is
/// the matrix scaled by a power of two, and the approximant is then squared back up.
pub fn expm<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Result<Array2<f64>, LinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(LinalgError::NotSquare { rows, cols });
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(LinalgError::NonFiniteInput);
    }
    let a = a.to_owned();
    let norm = one_norm(&a);
    if norm == 0.0 {
        return Ok(Array2::eye(rows));
    }

    let low_degree: [(f64, &[f64]); 4] = [
        (THETA_3, &PADE_3[..]),
        (THETA_5, &PADE_5[..]),
        (THETA_7, &PADE_7[..]),
        (THETA_9, &PADE_9[..]),
    ];
    for (theta, coefficients) in low_degree {
        if norm <= theta {
            return pade_low_degree(&a, coefficients);
        }
    }

    let squarings = (norm / THETA_13).log2().ceil().max(0.0) as i32;
    let scaled = &a / 2f64.powi(squarings);
    let mut result = pade_13(&scaled)?;
    for _ in 0..squarings {
        result = result.dot(&result);
    }
    if result.iter().all(|v| v.is_finite()) {
        Ok(result)
    } else {
        Err(LinalgError::NonFiniteSolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn exponential_of_diagonal_matrix() {
        for scale in [1e-3, 0.5, 4.0, 60.0] {
            let a = array![[-scale, 0.0], [0.0, 2.0 * scale]];
            let e = expm(&a).unwrap();
            assert_abs_diff_eq!(e[(0, 0)], (-scale).exp(), epsilon = 1e-12 * (2.0 * scale).exp());
            assert_abs_diff_eq!(e[(1, 1)], (2.0 * scale).exp(), epsilon = 1e-10 * (2.0 * scale).exp());
            assert_abs_diff_eq!(e[(0, 1)], 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn exponential_of_nilpotent_matrix() {
        let a = array![[0.0, 3.0], [0.0, 0.0]];
        let e = expm(&a).unwrap();
        assert_abs_diff_eq!(e[(0, 0)], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(e[(0, 1)], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(e[(1, 0)], 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(e[(1, 1)], 1.0, epsilon = 1e-14);
    }

    #[test]
    fn illness_death_generator_matches_closed_form() {
        // Rates spanning three orders of magnitude, evaluated at long horizons.
        let (h, r, h2) = (2e-4, 3e-3, 8e-2);
        for t in [1.0, 250.0, 3000.0] {
            let q = array![[-(h + r), r, h], [0.0, -h2, h2], [0.0, 0.0, 0.0]];
            let p = expm(&(q * t)).unwrap();
            let stay = (-(h + r) * t).exp();
            let progressed = r / (h + r - h2) * ((-h2 * t).exp() - stay);
            assert_abs_diff_eq!(p[(0, 0)], stay, epsilon = 1e-10);
            assert_abs_diff_eq!(p[(0, 1)], progressed, epsilon = 1e-10);
            assert_abs_diff_eq!(p[(0, 2)], 1.0 - stay - progressed, epsilon = 1e-10);
            for row in p.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn solve_recovers_known_solution() {
        let a = array![[4.0, 1.0], [2.0, 3.0]];
        let x = array![[1.0], [-2.0]];
        let b = a.dot(&x);
        let solved = solve(&a, &b).unwrap();
        assert_abs_diff_eq!(solved[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(solved[(1, 0)], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_rectangular_input() {
        let a = Array2::<f64>::zeros((2, 3));
        assert_eq!(
            expm(&a).unwrap_err(),
            LinalgError::NotSquare { rows: 2, cols: 3 }
        );
    }
}
