//! Built-in distributions, using BUGS names and parameterizations.

use rand::{Rng, RngCore};
use rand_distr::Distribution as _;

use crate::{
    distribution::{Distribution, Family, ParamSpec, Parameterization, Rank, Support},
    expr::node,
    math::{is_integer, ln_beta, ln_choose, ln_gamma},
    shape::Shape,
};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// `x * ln(y)` with the convention `0 * ln(0) = 0`.
fn xlny(x: f64, y: f64) -> f64 {
    if x == 0. {
        0.
    } else {
        x * y.ln()
    }
}

fn draw<D, E>(dist: Result<D, E>, rng: &mut dyn RngCore) -> f64
where
    D: rand_distr::Distribution<f64>,
{
    dist.map(|d| d.sample(rng)).unwrap_or(f64::NAN)
}

fn scalar_params(names: &[&str]) -> Vec<ParamSpec> {
    names.iter().map(|&n| ParamSpec::scalar(n)).collect()
}

pub struct Normal {
    params: Vec<ParamSpec>,
    alternates: Vec<Parameterization>,
}

impl Default for Normal {
    fn default() -> Self {
        Normal {
            params: scalar_params(&["mean", "sd"]),
            alternates: vec![
                Parameterization::new(["mean", "tau"])
                    .canonical("sd", 1. / node("tau").sqrt())
                    .reports("tau", 1. / node("sd").pow(2.)),
                Parameterization::new(["mean", "var"])
                    .canonical("sd", node("var").sqrt())
                    .reports("var", node("sd").pow(2.)),
            ],
        }
    }
}

impl Distribution for Normal {
    fn name(&self) -> &str {
        "dnorm"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Continuous
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::real()
    }

    fn alternates(&self) -> &[Parameterization] {
        &self.alternates
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let (mean, sd) = (params[0][0], params[1][0]);
        if !(sd > 0.) {
            return f64::NEG_INFINITY;
        }
        let z = (value[0] - mean) / sd;
        -LN_SQRT_2PI - sd.ln() - 0.5 * z * z
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        out[0] = draw(rand_distr::Normal::new(params[0][0], params[1][0]), rng);
    }
}

pub struct LogNormal {
    params: Vec<ParamSpec>,
    alternates: Vec<Parameterization>,
}

impl Default for LogNormal {
    fn default() -> Self {
        LogNormal {
            params: scalar_params(&["meanlog", "sdlog"]),
            alternates: vec![Parameterization::new(["meanlog", "taulog"])
                .canonical("sdlog", 1. / node("taulog").sqrt())
                .reports("taulog", 1. / node("sdlog").pow(2.))],
        }
    }
}

impl Distribution for LogNormal {
    fn name(&self) -> &str {
        "dlnorm"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Continuous
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::non_negative()
    }

    fn alternates(&self) -> &[Parameterization] {
        &self.alternates
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let (meanlog, sdlog) = (params[0][0], params[1][0]);
        let x = value[0];
        if !(sdlog > 0.) || x <= 0. {
            return f64::NEG_INFINITY;
        }
        let z = (x.ln() - meanlog) / sdlog;
        -x.ln() - LN_SQRT_2PI - sdlog.ln() - 0.5 * z * z
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        out[0] = draw(rand_distr::LogNormal::new(params[0][0], params[1][0]), rng);
    }
}

pub struct Exponential {
    params: Vec<ParamSpec>,
    alternates: Vec<Parameterization>,
}

impl Default for Exponential {
    fn default() -> Self {
        Exponential {
            params: scalar_params(&["rate"]),
            alternates: vec![Parameterization::new(["scale"])
                .canonical("rate", 1. / node("scale"))
                .reports("scale", 1. / node("rate"))],
        }
    }
}

impl Distribution for Exponential {
    fn name(&self) -> &str {
        "dexp"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Continuous
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::non_negative()
    }

    fn alternates(&self) -> &[Parameterization] {
        &self.alternates
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let rate = params[0][0];
        if !(rate > 0.) {
            return f64::NEG_INFINITY;
        }
        rate.ln() - value[0] * rate
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        out[0] = draw(rand_distr::Exp::new(params[0][0]), rng);
    }
}

pub struct Gamma {
    params: Vec<ParamSpec>,
    alternates: Vec<Parameterization>,
}

impl Default for Gamma {
    fn default() -> Self {
        Gamma {
            params: scalar_params(&["shape", "rate"]),
            alternates: vec![Parameterization::new(["shape", "scale"])
                .canonical("rate", 1. / node("scale"))
                .reports("scale", 1. / node("rate"))],
        }
    }
}

impl Distribution for Gamma {
    fn name(&self) -> &str {
        "dgamma"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Continuous
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::non_negative()
    }

    fn alternates(&self) -> &[Parameterization] {
        &self.alternates
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let (shape, rate) = (params[0][0], params[1][0]);
        if !(shape > 0.) || !(rate > 0.) {
            return f64::NEG_INFINITY;
        }
        let x = value[0];
        shape * rate.ln() - ln_gamma(shape) + xlny(shape - 1., x) - rate * x
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        out[0] = draw(rand_distr::Gamma::new(params[0][0], 1. / params[1][0]), rng);
    }
}

pub struct Beta {
    params: Vec<ParamSpec>,
}

impl Default for Beta {
    fn default() -> Self {
        Beta {
            params: scalar_params(&["shape1", "shape2"]),
        }
    }
}

impl Distribution for Beta {
    fn name(&self) -> &str {
        "dbeta"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Continuous
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::unit()
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let (a, b) = (params[0][0], params[1][0]);
        if !(a > 0.) || !(b > 0.) {
            return f64::NEG_INFINITY;
        }
        let x = value[0];
        xlny(a - 1., x) + xlny(b - 1., 1. - x) - ln_beta(a, b)
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        out[0] = draw(rand_distr::Beta::new(params[0][0], params[1][0]), rng);
    }
}

pub struct Uniform {
    params: Vec<ParamSpec>,
}

impl Default for Uniform {
    fn default() -> Self {
        Uniform {
            params: scalar_params(&["min", "max"]),
        }
    }
}

impl Distribution for Uniform {
    fn name(&self) -> &str {
        "dunif"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Continuous
    }

    fn support(&self, params: &[&[f64]]) -> Support {
        Support::new(params[0][0], params[1][0])
    }

    fn log_density(&self, _value: &[f64], params: &[&[f64]]) -> f64 {
        let (min, max) = (params[0][0], params[1][0]);
        if !(max > min) {
            return f64::NEG_INFINITY;
        }
        -(max - min).ln()
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        let (min, max) = (params[0][0], params[1][0]);
        out[0] = if max > min {
            min + (max - min) * rng.random::<f64>()
        } else {
            f64::NAN
        };
    }
}

pub struct Bernoulli {
    params: Vec<ParamSpec>,
}

impl Default for Bernoulli {
    fn default() -> Self {
        Bernoulli {
            params: scalar_params(&["prob"]),
        }
    }
}

impl Distribution for Bernoulli {
    fn name(&self) -> &str {
        "dbern"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Discrete
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::unit()
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let p = params[0][0];
        if !(0. ..=1.).contains(&p) {
            return f64::NEG_INFINITY;
        }
        let x = value[0];
        xlny(x, p) + xlny(1. - x, 1. - p)
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        let p = params[0][0];
        out[0] = if (0. ..=1.).contains(&p) {
            if rng.random::<f64>() < p {
                1.
            } else {
                0.
            }
        } else {
            f64::NAN
        };
    }
}

pub struct Binomial {
    params: Vec<ParamSpec>,
}

impl Default for Binomial {
    fn default() -> Self {
        Binomial {
            params: scalar_params(&["prob", "size"]),
        }
    }
}

impl Distribution for Binomial {
    fn name(&self) -> &str {
        "dbin"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Discrete
    }

    fn support(&self, params: &[&[f64]]) -> Support {
        Support::new(0., params[1][0])
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let (p, size) = (params[0][0], params[1][0]);
        if !(0. ..=1.).contains(&p) || !is_integer(size) || size < 0. {
            return f64::NEG_INFINITY;
        }
        let x = value[0];
        ln_choose(size, x) + xlny(x, p) + xlny(size - x, 1. - p)
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        let (p, size) = (params[0][0], params[1][0]);
        out[0] = if is_integer(size) && size >= 0. {
            rand_distr::Binomial::new(size as u64, p)
                .map(|d| d.sample(rng) as f64)
                .unwrap_or(f64::NAN)
        } else {
            f64::NAN
        };
    }
}

pub struct Poisson {
    params: Vec<ParamSpec>,
}

impl Default for Poisson {
    fn default() -> Self {
        Poisson {
            params: scalar_params(&["lambda"]),
        }
    }
}

impl Distribution for Poisson {
    fn name(&self) -> &str {
        "dpois"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Discrete
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::non_negative()
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let lambda = params[0][0];
        if !(lambda >= 0.) {
            return f64::NEG_INFINITY;
        }
        let x = value[0];
        xlny(x, lambda) - lambda - ln_gamma(x + 1.)
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        let lambda = params[0][0];
        out[0] = if lambda == 0. {
            0.
        } else {
            draw(rand_distr::Poisson::new(lambda), rng)
        };
    }
}

/// Categorical over `1..=k`. The probability vector need not be normalized.
pub struct Categorical {
    params: Vec<ParamSpec>,
}

impl Default for Categorical {
    fn default() -> Self {
        Categorical {
            params: vec![ParamSpec::vector("prob")],
        }
    }
}

impl Distribution for Categorical {
    fn name(&self) -> &str {
        "dcat"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn family(&self) -> Family {
        Family::Discrete
    }

    fn support(&self, params: &[&[f64]]) -> Support {
        Support::new(1., params[0].len() as f64)
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let prob = params[0];
        if prob.iter().any(|&p| !(p >= 0.)) {
            return f64::NEG_INFINITY;
        }
        let total: f64 = prob.iter().sum();
        let k = value[0];
        if !(k >= 1. && k <= prob.len() as f64) {
            return f64::NEG_INFINITY;
        }
        (prob[k as usize - 1] / total).ln()
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        let prob = params[0];
        let total: f64 = prob.iter().sum();
        if !(total > 0.) || prob.iter().any(|&p| !(p >= 0.)) {
            out[0] = f64::NAN;
            return;
        }
        let u = rng.random::<f64>() * total;
        let mut acc = 0.;
        for (i, p) in prob.iter().enumerate() {
            acc += p;
            if u < acc {
                out[0] = (i + 1) as f64;
                return;
            }
        }
        out[0] = prob.len() as f64;
    }
}

/// Dirichlet over the probability simplex.
pub struct Dirichlet {
    params: Vec<ParamSpec>,
}

impl Default for Dirichlet {
    fn default() -> Self {
        Dirichlet {
            params: vec![ParamSpec::vector("alpha")],
        }
    }
}

const SIMPLEX_TOL: f64 = 1e-8;

impl Distribution for Dirichlet {
    fn name(&self) -> &str {
        "ddirch"
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn value_rank(&self) -> Rank {
        Rank::Vector
    }

    fn family(&self) -> Family {
        Family::Continuous
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        Support::unit()
    }

    fn check_shapes(&self, value: &Shape, params: &[Shape]) -> Result<(), String> {
        if !value.is_vector() || params[0] != *value {
            return Err(format!(
                "ddirch needs a vector node matching alpha, got {} and {}",
                value, params[0]
            ));
        }
        Ok(())
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        let alpha = params[0];
        if alpha.iter().any(|&a| !(a > 0.)) {
            return f64::NEG_INFINITY;
        }
        let total: f64 = value.iter().sum();
        if (total - 1.).abs() > SIMPLEX_TOL {
            return f64::NEG_INFINITY;
        }
        let alpha_sum: f64 = alpha.iter().sum();
        let mut logp = ln_gamma(alpha_sum);
        for (&a, &x) in alpha.iter().zip(value) {
            logp += xlny(a - 1., x) - ln_gamma(a);
        }
        logp
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        let alpha = params[0];
        for (o, &a) in out.iter_mut().zip(alpha) {
            *o = draw(rand_distr::Gamma::new(a, 1.), rng);
        }
        let total: f64 = out.iter().sum();
        out.iter_mut().for_each(|o| *o /= total);
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn ln_sqrt_2pi() -> f64 {
        0.5 * (2. * PI).ln()
    }

    #[test]
    fn normal_density_and_alternates() {
        let dist = Normal::default();
        let logp = dist.log_density(&[1.], &[&[0.], &[2.]]);
        assert_abs_diff_eq!(logp, -ln_sqrt_2pi() - 2f64.ln() - 0.125, epsilon = 1e-12);
        assert_abs_diff_eq!(LN_SQRT_2PI, ln_sqrt_2pi(), epsilon = 1e-15);
        assert_eq!(dist.alternates().len(), 2);
        assert_eq!(dist.checked_log_density(&[0.], &[&[0.], &[-1.]]), f64::NEG_INFINITY);
    }

    #[test]
    fn out_of_support_is_neg_infinity() {
        assert_eq!(
            Exponential::default().checked_log_density(&[-0.1], &[&[1.]]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            Beta::default().checked_log_density(&[1.5], &[&[2.], &[2.]]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            Poisson::default().checked_log_density(&[1.5], &[&[2.]]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            Uniform::default().checked_log_density(&[3.], &[&[0.], &[2.]]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            Categorical::default().checked_log_density(&[4.], &[&[0.2, 0.3, 0.5]]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            Binomial::default().checked_log_density(&[6.], &[&[0.5], &[5.]]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn discrete_densities_normalize() {
        let bin = Binomial::default();
        let total: f64 = (0..=10)
            .map(|k| bin.log_density(&[k as f64], &[&[0.3], &[10.]]).exp())
            .sum();
        assert_abs_diff_eq!(total, 1., epsilon = 1e-10);

        let pois = Poisson::default();
        let total: f64 = (0..60)
            .map(|k| pois.log_density(&[k as f64], &[&[4.]]).exp())
            .sum();
        assert_abs_diff_eq!(total, 1., epsilon = 1e-10);

        let cat = Categorical::default();
        assert_abs_diff_eq!(
            cat.log_density(&[2.], &[&[1., 3.]]),
            0.75f64.ln(),
            epsilon = 1e-12
        );
        assert_eq!(
            Bernoulli::default().log_density(&[0.], &[&[0.]]),
            0.
        );
    }

    #[test]
    fn dirichlet_samples_lie_on_simplex() {
        let dist = Dirichlet::default();
        let mut rng = StdRng::seed_from_u64(42);
        let alpha = [1., 2., 3.];
        let mut out = [0.; 3];
        dist.sample(&[&alpha], &mut rng, &mut out);
        assert_abs_diff_eq!(out.iter().sum::<f64>(), 1., epsilon = 1e-12);
        assert!(dist.checked_log_density(&out, &[&alpha]).is_finite());
        assert_eq!(
            dist.checked_log_density(&[0.5, 0.5, 0.5], &[&alpha]),
            f64::NEG_INFINITY
        );
        assert!(dist
            .check_shapes(&Shape::vector(3), &[Shape::vector(2)])
            .is_err());
    }

    #[test]
    fn dirichlet_boundary_with_unit_alpha() {
        let dist = Dirichlet::default();
        let logp = dist.checked_log_density(&[0., 0.5, 0.5], &[&[1., 1., 1.]]);
        assert_abs_diff_eq!(logp, 2f64.ln(), epsilon = 1e-12);
        assert_eq!(
            dist.checked_log_density(&[0., 0.5, 0.5], &[&[2., 1., 1.]]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn invalid_parameters_sample_nan() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut out = [0.];
        Normal::default().sample(&[&[0.], &[-1.]], &mut rng, &mut out);
        assert!(out[0].is_nan());
        Bernoulli::default().sample(&[&[1.5]], &mut rng, &mut out);
        assert!(out[0].is_nan());
    }

    proptest! {
        #[test]
        fn exponential_closed_form(rate in 0.01f64..100., seed in any::<u64>()) {
            let dist = Exponential::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let mut out = [0.];
            dist.sample(&[&[rate]], &mut rng, &mut out);
            prop_assert!(out[0] >= 0.);
            let logp = dist.checked_log_density(&out, &[&[rate]]);
            prop_assert!((logp - (rate.ln() - out[0] * rate)).abs() < 1e-9);
        }

        #[test]
        fn samples_are_in_support(seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut out = [0.];
            let gamma = Gamma::default();
            gamma.sample(&[&[2.], &[3.]], &mut rng, &mut out);
            prop_assert!(gamma.in_support(&out, &[&[2.], &[3.]]));
            let bin = Binomial::default();
            bin.sample(&[&[0.4], &[7.]], &mut rng, &mut out);
            prop_assert!(bin.in_support(&out, &[&[0.4], &[7.]]));
            let cat = Categorical::default();
            cat.sample(&[&[0.1, 0.2, 0.7]], &mut rng, &mut out);
            prop_assert!(cat.in_support(&out, &[&[0.1, 0.2, 0.7]]));
        }
    }
}
