use std::{collections::HashSet, fmt::Debug, sync::Arc};

use rand::RngCore;

use crate::{
    expr::{node, Expr},
    math::is_integer,
    registry::RegistryError,
    shape::Shape,
};

/// Whether a parameter or value is a scalar or a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    Scalar,
    Vector,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamSpec {
    pub name: String,
    pub rank: Rank,
}

impl ParamSpec {
    pub fn scalar(name: &str) -> Self {
        ParamSpec {
            name: name.to_string(),
            rank: Rank::Scalar,
        }
    }

    pub fn vector(name: &str) -> Self {
        ParamSpec {
            name: name.to_string(),
            rank: Rank::Vector,
        }
    }
}

impl From<&str> for ParamSpec {
    fn from(name: &str) -> Self {
        ParamSpec::scalar(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Continuous,
    Discrete,
}

/// Closed interval of admissible values. Either bound may be infinite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Support {
    pub lower: f64,
    pub upper: f64,
}

impl Support {
    pub fn new(lower: f64, upper: f64) -> Self {
        Support { lower, upper }
    }

    pub fn real() -> Self {
        Support::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn non_negative() -> Self {
        Support::new(0., f64::INFINITY)
    }

    pub fn unit() -> Self {
        Support::new(0., 1.)
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }

    pub fn is_bounded_below(&self) -> bool {
        self.lower.is_finite()
    }

    pub fn is_bounded_above(&self) -> bool {
        self.upper.is_finite()
    }
}

impl Default for Support {
    fn default() -> Self {
        Support::real()
    }
}

/// An alternate way of supplying the parameters of a distribution.
///
/// `canonical` gives each canonical parameter as an expression over the
/// alternate parameter names. Canonical parameters that are also alternate
/// names and have no explicit entry pass through unchanged. `reported`
/// gives each alternate parameter as an expression over the canonical
/// ones, so that a fitted node can report e.g. its `scale`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameterization {
    pub params: Vec<String>,
    pub canonical: Vec<(String, Expr<String>)>,
    pub reported: Vec<(String, Expr<String>)>,
}

impl Parameterization {
    pub fn new<'a>(params: impl IntoIterator<Item = &'a str>) -> Self {
        Parameterization {
            params: params.into_iter().map(str::to_string).collect(),
            canonical: Vec::new(),
            reported: Vec::new(),
        }
    }

    pub fn canonical(mut self, name: &str, expr: Expr<String>) -> Self {
        self.canonical.push((name.to_string(), expr));
        self
    }

    pub fn reports(mut self, name: &str, expr: Expr<String>) -> Self {
        self.reported.push((name.to_string(), expr));
        self
    }

    /// Expression for canonical parameter `name` over this parameterization's
    /// names.
    pub fn canonical_expr(&self, name: &str) -> Option<Expr<String>> {
        if let Some((_, expr)) = self.canonical.iter().find(|(n, _)| n == name) {
            return Some(expr.clone());
        }
        self.params.iter().any(|p| p == name).then(|| node(name))
    }

    pub fn matches(&self, supplied: &HashSet<&str>) -> bool {
        self.params.len() == supplied.len() && self.params.iter().all(|p| supplied.contains(p.as_str()))
    }
}

/// The capability set every registered distribution provides.
///
/// Parameters are passed in canonical order as flat slices. The log density
/// is never an error: values outside the support, or invalid parameters,
/// give `-inf`.
pub trait Distribution: Send + Sync {
    fn name(&self) -> &str;

    /// Canonical parameters, in the order `log_density` and `sample` expect.
    fn params(&self) -> &[ParamSpec];

    fn value_rank(&self) -> Rank {
        Rank::Scalar
    }

    fn family(&self) -> Family;

    /// Support of each value element. May depend on parameter values.
    fn support(&self, params: &[&[f64]]) -> Support;

    fn alternates(&self) -> &[Parameterization] {
        &[]
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64;

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]);

    fn in_support(&self, value: &[f64], params: &[&[f64]]) -> bool {
        let support = self.support(params);
        let discrete = self.family() == Family::Discrete;
        value
            .iter()
            .all(|&x| support.contains(x) && (!discrete || is_integer(x)))
    }

    /// Check the node shape and parameter shapes against the declared ranks.
    fn check_shapes(&self, value: &Shape, params: &[Shape]) -> Result<(), String> {
        let rank_ok = |rank: Rank, shape: &Shape| match rank {
            Rank::Scalar => shape.is_scalar(),
            Rank::Vector => shape.is_vector(),
        };
        if !rank_ok(self.value_rank(), value) {
            return Err(format!(
                "'{}' has {:?} values but the node has shape {}",
                self.name(),
                self.value_rank(),
                value
            ));
        }
        for (spec, shape) in self.params().iter().zip(params) {
            if !rank_ok(spec.rank, shape) {
                return Err(format!(
                    "parameter '{}' of '{}' must be {:?}, got shape {}",
                    spec.name,
                    self.name(),
                    spec.rank,
                    shape
                ));
            }
        }
        Ok(())
    }

    /// Log density with the support check applied first. NaN maps to `-inf`.
    fn checked_log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        if !self.in_support(value, params) {
            return f64::NEG_INFINITY;
        }
        let logp = self.log_density(value, params);
        if logp.is_nan() {
            f64::NEG_INFINITY
        } else {
            logp
        }
    }
}

impl Debug for dyn Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distribution<{}>", self.name())
    }
}

pub type DensityFn = Arc<dyn Fn(&[f64], &[&[f64]]) -> f64 + Send + Sync>;
pub type SampleFn = Arc<dyn Fn(&[&[f64]], &mut dyn RngCore, &mut [f64]) + Send + Sync>;

/// A closure-based distribution definition for third-party registration.
///
/// ```
/// use graphmc::{DistributionDescriptor, Parameterization, Registry, Support};
/// use graphmc::expr::node;
/// use rand::Rng;
///
/// let descriptor = DistributionDescriptor::new()
///     .density(["rate"], |x, p| p[0][0].ln() - x[0] * p[0][0])
///     .sampler(["rate"], |p, rng, out| {
///         let u: f64 = rng.random();
///         out[0] = -(1. - u).ln() / p[0][0];
///     })
///     .alternate(
///         Parameterization::new(["scale"])
///             .canonical("rate", 1. / node("scale"))
///             .reports("scale", 1. / node("rate")),
///     )
///     .support(Support::non_negative());
///
/// let registry = Registry::new();
/// registry.register("my_exp", descriptor).unwrap();
/// assert!(registry.lookup("my_exp").is_ok());
/// ```
#[derive(Clone, Default)]
pub struct DistributionDescriptor {
    density: Option<(Vec<ParamSpec>, DensityFn)>,
    sampler: Option<(Vec<String>, SampleFn)>,
    alternates: Vec<Parameterization>,
    support: Support,
    family: Option<Family>,
    value_rank: Option<Rank>,
}

impl DistributionDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn density<P, F>(mut self, params: impl IntoIterator<Item = P>, density: F) -> Self
    where
        P: Into<ParamSpec>,
        F: Fn(&[f64], &[&[f64]]) -> f64 + Send + Sync + 'static,
    {
        let params = params.into_iter().map(Into::into).collect();
        self.density = Some((params, Arc::new(density)));
        self
    }

    pub fn sampler<'a, F>(mut self, params: impl IntoIterator<Item = &'a str>, sampler: F) -> Self
    where
        F: Fn(&[&[f64]], &mut dyn RngCore, &mut [f64]) + Send + Sync + 'static,
    {
        let params = params.into_iter().map(str::to_string).collect();
        self.sampler = Some((params, Arc::new(sampler)));
        self
    }

    pub fn alternate(mut self, alternate: Parameterization) -> Self {
        self.alternates.push(alternate);
        self
    }

    pub fn support(mut self, support: Support) -> Self {
        self.support = support;
        self
    }

    pub fn family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    pub fn value_rank(mut self, rank: Rank) -> Self {
        self.value_rank = Some(rank);
        self
    }

    /// Validate the bundle and turn it into a distribution named `name`.
    pub(crate) fn into_distribution(self, name: &str) -> Result<CustomDistribution, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidDescriptor {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let (params, density) = self
            .density
            .ok_or_else(|| invalid("missing density procedure"))?;
        let (sampler_params, sampler) = self
            .sampler
            .ok_or_else(|| invalid("missing sampling procedure"))?;
        if params.len() != sampler_params.len()
            || params.iter().zip(&sampler_params).any(|(a, b)| &a.name != b)
        {
            return Err(invalid(
                "density and sampling procedures declare different parameters",
            ));
        }
        if !(self.support.lower <= self.support.upper) {
            return Err(invalid("support lower bound exceeds upper bound"));
        }
        let dist = CustomDistribution {
            name: name.to_string(),
            params,
            density,
            sampler,
            alternates: self.alternates,
            support: self.support,
            family: self.family.unwrap_or(Family::Continuous),
            value_rank: self.value_rank.unwrap_or(Rank::Scalar),
        };
        validate_params(&dist)?;
        Ok(dist)
    }
}

/// Structural checks shared by descriptor and trait-object registration.
pub(crate) fn validate_params(dist: &dyn Distribution) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidDescriptor {
        name: dist.name().to_string(),
        reason,
    };
    let mut seen = HashSet::new();
    for spec in dist.params() {
        if spec.name.is_empty() {
            return Err(invalid("empty parameter name".to_string()));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(invalid(format!("duplicate parameter '{}'", spec.name)));
        }
    }
    for alt in dist.alternates() {
        let alt_names: HashSet<&str> = alt.params.iter().map(String::as_str).collect();
        if alt_names.len() != alt.params.len() {
            return Err(invalid(format!(
                "alternate {:?} repeats a parameter",
                alt.params
            )));
        }
        for spec in dist.params() {
            let Some(expr) = alt.canonical_expr(&spec.name) else {
                return Err(invalid(format!(
                    "alternate {:?} does not define '{}'",
                    alt.params, spec.name
                )));
            };
            if let Some(r) = expr.refs().into_iter().find(|r| !alt_names.contains(r.as_str())) {
                return Err(invalid(format!(
                    "alternate {:?} references undeclared '{}'",
                    alt.params, r
                )));
            }
        }
        for (name, expr) in &alt.reported {
            if let Some(r) = expr.refs().into_iter().find(|r| !seen.contains(r.as_str())) {
                return Err(invalid(format!(
                    "reported parameter '{}' references non-canonical '{}'",
                    name, r
                )));
            }
        }
    }
    Ok(())
}

/// A distribution assembled from a `DistributionDescriptor`.
pub struct CustomDistribution {
    name: String,
    params: Vec<ParamSpec>,
    density: DensityFn,
    sampler: SampleFn,
    alternates: Vec<Parameterization>,
    support: Support,
    family: Family,
    value_rank: Rank,
}

impl Distribution for CustomDistribution {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    fn value_rank(&self) -> Rank {
        self.value_rank
    }

    fn family(&self) -> Family {
        self.family
    }

    fn support(&self, _params: &[&[f64]]) -> Support {
        self.support
    }

    fn alternates(&self) -> &[Parameterization] {
        &self.alternates
    }

    fn log_density(&self, value: &[f64], params: &[&[f64]]) -> f64 {
        (self.density)(value, params)
    }

    fn sample(&self, params: &[&[f64]], rng: &mut dyn RngCore, out: &mut [f64]) {
        (self.sampler)(params, rng, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::node;
    use pretty_assertions::assert_eq;

    fn exp_descriptor() -> DistributionDescriptor {
        DistributionDescriptor::new()
            .density(["rate"], |x, p| p[0][0].ln() - x[0] * p[0][0])
            .sampler(["rate"], |_p, _rng, out| out[0] = 1.)
            .support(Support::non_negative())
    }

    #[test]
    fn missing_procedures_are_invalid() {
        let no_sampler = DistributionDescriptor::new().density(["rate"], |_, _| 0.);
        assert!(matches!(
            no_sampler.into_distribution("d"),
            Err(RegistryError::InvalidDescriptor { .. })
        ));
        let no_density = DistributionDescriptor::new().sampler(["rate"], |_, _, _| {});
        assert!(matches!(
            no_density.into_distribution("d"),
            Err(RegistryError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn inconsistent_parameter_lists_are_invalid() {
        let descriptor = DistributionDescriptor::new()
            .density(["rate"], |_, _| 0.)
            .sampler(["scale"], |_, _, _| {});
        let err = descriptor.into_distribution("d").err().unwrap();
        assert_eq!(
            err,
            RegistryError::InvalidDescriptor {
                name: "d".to_string(),
                reason: "density and sampling procedures declare different parameters"
                    .to_string()
            }
        );
    }

    #[test]
    fn alternates_must_cover_canonical_parameters() {
        let descriptor = exp_descriptor().alternate(Parameterization::new(["scale"]));
        assert!(descriptor.into_distribution("d").is_err());

        let descriptor = exp_descriptor()
            .alternate(Parameterization::new(["scale"]).canonical("rate", 1. / node("mean")));
        assert!(descriptor.into_distribution("d").is_err());

        let descriptor = exp_descriptor()
            .alternate(Parameterization::new(["scale"]).canonical("rate", 1. / node("scale")));
        assert!(descriptor.into_distribution("d").is_ok());
    }

    #[test]
    fn support_is_applied_before_density() {
        let dist = exp_descriptor().into_distribution("d").unwrap();
        let rate = [0.5];
        assert_eq!(dist.checked_log_density(&[-1.], &[&rate]), f64::NEG_INFINITY);
        assert_eq!(dist.checked_log_density(&[0.], &[&rate]), 0.5f64.ln());
    }

    #[test]
    fn passthrough_parameters() {
        let alt = Parameterization::new(["mean", "tau"]).canonical("sd", 1. / node("tau").sqrt());
        assert_eq!(alt.canonical_expr("mean"), Some(node("mean")));
        assert!(alt.canonical_expr("sd").is_some());
        assert_eq!(alt.canonical_expr("var"), None);
    }
}
