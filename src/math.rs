use std::f64::consts::PI;

use itertools::izip;

/// `log(exp(a) + exp(b))` without overflow. NaN if either input is NaN.
#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi.is_infinite() {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Numerically stable `log(sum(exp(x)))`.
///
/// Returns `-inf` for an empty slice or if every entry is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

const LANCZOS_G: f64 = 7.;
const LANCZOS_COEF: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the absolute value of the gamma function (Lanczos, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x <= 0. && x == x.floor() {
        return f64::INFINITY;
    }
    if x < 0.5 {
        // Reflection formula
        return (PI / (PI * x).sin()).abs().ln() - ln_gamma(1. - x);
    }
    let x = x - 1.;
    let mut acc = LANCZOS_COEF[0];
    let t = x + LANCZOS_G + 0.5;
    for (i, coef) in LANCZOS_COEF.iter().enumerate().skip(1) {
        acc += coef / (x + i as f64);
    }
    0.5 * (2. * PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// `log(n choose k)` for real-valued arguments.
pub fn ln_choose(n: f64, k: f64) -> f64 {
    ln_gamma(n + 1.) - ln_gamma(k + 1.) - ln_gamma(n - k + 1.)
}

#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1. - p)).ln()
}

#[inline]
pub fn expit(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

#[inline]
pub fn is_integer(x: f64) -> bool {
    x.is_finite() && x == x.floor()
}

pub fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(a, b)| a * b).sum()
}
