//! Bracketed scalar root finding.
//!
//! Brent's method on a sign-changing bracket, with optional bounded extension of the bracket
//! when the initial interval does not enclose a root. Every calibration and inversion in the
//! crate goes through [`find_root`], so all of them share the same termination guarantees:
//! a bounded number of bracket extensions, a bounded number of Brent iterations, and an
//! explicit error instead of a best guess when either budget runs out.

use log::debug;
use thiserror::Error;

/// Default cap on bracket extensions. Each extension doubles the bracket width.
pub const DEFAULT_MAX_EXTENSIONS: usize = 60;
/// Default cap on Brent iterations once a root is bracketed.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RootError {
    #[error("invalid bracket [{lower}, {upper}]: bounds must be finite with lower < upper")]
    InvalidBracket { lower: f64, upper: f64 },
    #[error(
        "no sign change on [{lower}, {upper}] (f(lower)={f_lower}, f(upper)={f_upper}) after {extensions} bracket extensions"
    )]
    NoSignChange {
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
        extensions: usize,
    },
    #[error("objective returned a non-finite value ({value}) at x={x}")]
    NonFinite { x: f64, value: f64 },
    #[error("root finding did not converge within {iterations} iterations (bracket width {width})")]
    NotConverged { iterations: usize, width: f64 },
}

/// Direction(s) in which the bracket may grow when it does not enclose a sign change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    No,
    Up,
    Down,
    Both,
}

#[derive(Debug, Clone, Copy)]
pub struct RootOptions {
    /// Absolute tolerance on the root location; a relative `2·ε·|x|` term is always added.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub extend: Extend,
    pub max_extensions: usize,
    /// Downward extension never moves the lower bound below this value.
    pub floor: f64,
}

impl Default for RootOptions {
    fn default() -> Self {
        Self {
            tolerance: f64::EPSILON,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            extend: Extend::No,
            max_extensions: DEFAULT_MAX_EXTENSIONS,
            floor: f64::NEG_INFINITY,
        }
    }
}

impl RootOptions {
    pub fn extend(mut self, extend: Extend) -> Self {
        self.extend = extend;
        self
    }

    pub fn floor(mut self, floor: f64) -> Self {
        self.floor = floor;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Root {
    pub x: f64,
    pub value: f64,
    pub iterations: usize,
    pub extensions: usize,
}

fn evaluate<F: FnMut(f64) -> f64>(f: &mut F, x: f64) -> Result<f64, RootError> {
    let value = f(x);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RootError::NonFinite { x, value })
    }
}

#[inline]
fn same_sign(a: f64, b: f64) -> bool {
    (a > 0.0 && b > 0.0) || (a < 0.0 && b < 0.0)
}

/// Finds a root of `f` in `[lower, upper]`, growing the bracket per `options.extend` when the
/// endpoints do not straddle zero.
pub fn find_root<F>(
    mut f: F,
    lower: f64,
    upper: f64,
    options: RootOptions,
) -> Result<Root, RootError>
where
    F: FnMut(f64) -> f64,
{
    if !lower.is_finite() || !upper.is_finite() || lower >= upper {
        return Err(RootError::InvalidBracket { lower, upper });
    }

    let mut a = lower;
    let mut b = upper;
    let mut fa = evaluate(&mut f, a)?;
    let mut fb = evaluate(&mut f, b)?;
    let mut extensions = 0usize;

    while same_sign(fa, fb) {
        if extensions >= options.max_extensions {
            return Err(RootError::NoSignChange {
                lower: a,
                upper: b,
                f_lower: fa,
                f_upper: fb,
                extensions,
            });
        }
        let width = b - a;
        let mut moved = false;
        if matches!(options.extend, Extend::Down | Extend::Both) && a > options.floor {
            a = (a - width).max(options.floor);
            fa = evaluate(&mut f, a)?;
            moved = true;
        }
        if matches!(options.extend, Extend::Up | Extend::Both) {
            b += width;
            fb = evaluate(&mut f, b)?;
            moved = true;
        }
        if !moved {
            return Err(RootError::NoSignChange {
                lower: a,
                upper: b,
                f_lower: fa,
                f_upper: fb,
                extensions,
            });
        }
        extensions += 1;
        debug!("extended root bracket to [{a}, {b}] (f: {fa}, {fb})");
    }

    brent(&mut f, a, b, fa, fb, options, extensions)
}

fn brent<F: FnMut(f64) -> f64>(
    f: &mut F,
    mut a: f64,
    mut b: f64,
    mut fa: f64,
    mut fb: f64,
    options: RootOptions,
    extensions: usize,
) -> Result<Root, RootError> {
    if fa == 0.0 {
        return Ok(Root {
            x: a,
            value: fa,
            iterations: 0,
            extensions,
        });
    }
    if fb == 0.0 {
        return Ok(Root {
            x: b,
            value: fb,
            iterations: 0,
            extensions,
        });
    }

    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut e = d;

    for iteration in 1..=options.max_iterations {
        if same_sign(fb, fc) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }

        let tol1 = 2.0 * f64::EPSILON * b.abs() + 0.5 * options.tolerance;
        let xm = 0.5 * (c - b);
        if xm.abs() <= tol1 || fb == 0.0 {
            return Ok(Root {
                x: b,
                value: fb,
                iterations: iteration,
                extensions,
            });
        }

        if e.abs() >= tol1 && fa.abs() > fb.abs() {
            // Inverse quadratic interpolation, or secant when only two points are distinct.
            let s = fb / fa;
            let (mut p, mut q);
            if a == c {
                p = 2.0 * xm * s;
                q = 1.0 - s;
            } else {
                let qa = fa / fc;
                let r = fb / fc;
                p = s * (2.0 * xm * qa * (qa - r) - (b - a) * (r - 1.0));
                q = (qa - 1.0) * (r - 1.0) * (s - 1.0);
            }
            if p > 0.0 {
                q = -q;
            }
            p = p.abs();
            let min1 = 3.0 * xm * q - (tol1 * q).abs();
            let min2 = (e * q).abs();
            if 2.0 * p < min1.min(min2) {
                e = d;
                d = p / q;
            } else {
                d = xm;
                e = d;
            }
        } else {
            d = xm;
            e = d;
        }

        a = b;
        fa = fb;
        if d.abs() > tol1 {
            b += d;
        } else {
            b += tol1.copysign(xm);
        }
        fb = evaluate(f, b)?;
    }

    Err(RootError::NotConverged {
        iterations: options.max_iterations,
        width: (c - b).abs(),
    })
}
