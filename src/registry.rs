use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, OnceLock, RwLock},
};

use itertools::Itertools;
use thiserror::Error;

use crate::{
    distribution::{validate_params, Distribution, DistributionDescriptor},
    distributions,
    expr::{node, Expr},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid descriptor for distribution '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },
    #[error("unknown distribution '{0}'")]
    UnknownDistribution(String),
    #[error("distribution '{name}' has no parameterization using {supplied:?}")]
    UnsupportedParameterization { name: String, supplied: Vec<String> },
}

/// A user-supplied parameter set mapped onto a distribution's canonical
/// parameters.
#[derive(Debug, Clone)]
pub struct ResolvedParams {
    pub distribution: Arc<dyn Distribution>,
    /// One expression per canonical parameter, over the supplied names.
    pub canonical: Vec<Expr<String>>,
    /// Index of the alternate parameterization used, if any.
    pub alternate: Option<usize>,
}

/// Catalog of distributions, keyed by name.
///
/// Lookups take a read lock; `register` takes the write lock only for the
/// swap of a fully validated entry, so a build never observes a partially
/// registered distribution.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<dyn Distribution>>>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in distributions.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        register_builtins(&registry);
        registry
    }

    /// The process-wide registry. It starts empty and only changes through
    /// explicit `register` calls (or `register_builtins`).
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    pub fn register(&self, name: &str, descriptor: DistributionDescriptor) -> Result<(), RegistryError> {
        let dist = descriptor.into_distribution(name)?;
        self.insert(name, Arc::new(dist));
        Ok(())
    }

    /// Register a distribution implemented directly against the
    /// `Distribution` trait, under its own name.
    pub fn register_distribution(&self, dist: impl Distribution + 'static) -> Result<(), RegistryError> {
        validate_params(&dist)?;
        let name = dist.name().to_string();
        self.insert(&name, Arc::new(dist));
        Ok(())
    }

    fn insert(&self, name: &str, dist: Arc<dyn Distribution>) {
        let previous = self
            .entries
            .write()
            .expect("Poisoned registry lock")
            .insert(name.to_string(), dist);
        if previous.is_some() {
            log::debug!("replaced distribution '{}'", name);
        } else {
            log::debug!("registered distribution '{}'", name);
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Distribution>, RegistryError> {
        self.entries
            .read()
            .expect("Poisoned registry lock")
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownDistribution(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("Poisoned registry lock")
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("Poisoned registry lock")
            .keys()
            .cloned()
            .sorted()
            .collect()
    }

    /// Map the supplied parameter names onto the canonical parameters of
    /// distribution `name`.
    ///
    /// The canonical set is tried first, then each alternate
    /// parameterization. Order of `supplied` does not matter.
    pub fn resolve_parameterization(
        &self,
        name: &str,
        supplied: &[&str],
    ) -> Result<ResolvedParams, RegistryError> {
        let distribution = self.lookup(name)?;
        let supplied_set: HashSet<&str> = supplied.iter().copied().collect();
        let unsupported = || RegistryError::UnsupportedParameterization {
            name: name.to_string(),
            supplied: supplied.iter().map(|s| s.to_string()).sorted().collect(),
        };
        if supplied_set.len() != supplied.len() {
            return Err(unsupported());
        }

        let params = distribution.params();
        if params.len() == supplied_set.len()
            && params.iter().all(|p| supplied_set.contains(p.name.as_str()))
        {
            let canonical = params.iter().map(|p| node(&p.name)).collect();
            return Ok(ResolvedParams {
                distribution,
                canonical,
                alternate: None,
            });
        }

        let found = distribution
            .alternates()
            .iter()
            .position(|alt| alt.matches(&supplied_set));
        let Some(idx) = found else {
            return Err(unsupported());
        };
        let alt = &distribution.alternates()[idx];
        let canonical = params
            .iter()
            .map(|p| alt.canonical_expr(&p.name).ok_or_else(unsupported))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedParams {
            distribution,
            canonical,
            alternate: Some(idx),
        })
    }
}

/// Install the built-in BUGS-style distributions into `registry`.
pub fn register_builtins(registry: &Registry) {
    let builtins: Vec<Arc<dyn Distribution>> = vec![
        Arc::new(distributions::Normal::default()),
        Arc::new(distributions::LogNormal::default()),
        Arc::new(distributions::Exponential::default()),
        Arc::new(distributions::Gamma::default()),
        Arc::new(distributions::Beta::default()),
        Arc::new(distributions::Uniform::default()),
        Arc::new(distributions::Bernoulli::default()),
        Arc::new(distributions::Binomial::default()),
        Arc::new(distributions::Poisson::default()),
        Arc::new(distributions::Categorical::default()),
        Arc::new(distributions::Dirichlet::default()),
    ];
    for dist in builtins {
        let name = dist.name().to_string();
        registry.insert(&name, dist);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        distribution::{Parameterization, Support},
        expr::NoRefs,
    };
    use pretty_assertions::assert_eq;
    use rand::Rng;

    fn exp_like() -> DistributionDescriptor {
        DistributionDescriptor::new()
            .density(["rate"], |x, p| p[0][0].ln() - x[0] * p[0][0])
            .sampler(["rate"], |p, rng, out| {
                let u: f64 = rng.random();
                out[0] = -(1. - u).ln() / p[0][0];
            })
            .alternate(
                Parameterization::new(["scale"])
                    .canonical("rate", 1. / node("scale"))
                    .reports("scale", 1. / node("rate")),
            )
            .support(Support::non_negative())
    }

    #[test]
    fn lookup_unknown() {
        let registry = Registry::new();
        assert_eq!(
            registry.lookup("dnorm").err(),
            Some(RegistryError::UnknownDistribution("dnorm".to_string()))
        );
    }

    #[test]
    fn register_replaces_existing() {
        let registry = Registry::new();
        registry.register("e", exp_like()).unwrap();
        assert!(registry.lookup("e").unwrap().alternates().len() == 1);

        let plain = DistributionDescriptor::new()
            .density(["lambda"], |_, _| 0.)
            .sampler(["lambda"], |_, _, _| {});
        registry.register("e", plain).unwrap();
        let dist = registry.lookup("e").unwrap();
        assert_eq!(dist.params()[0].name, "lambda");
        assert_eq!(registry.names(), vec!["e".to_string()]);
    }

    #[test]
    fn failed_registration_keeps_previous_entry() {
        let registry = Registry::new();
        registry.register("e", exp_like()).unwrap();
        let broken = DistributionDescriptor::new().density(["rate"], |_, _| 0.);
        assert!(registry.register("e", broken).is_err());
        assert_eq!(registry.lookup("e").unwrap().params()[0].name, "rate");
    }

    #[test]
    fn resolve_alternate_parameterization() {
        let registry = Registry::new();
        registry.register("e", exp_like()).unwrap();

        let canonical = registry.resolve_parameterization("e", &["rate"]).unwrap();
        assert_eq!(canonical.alternate, None);
        assert_eq!(canonical.canonical, vec![node("rate")]);

        let resolved = registry.resolve_parameterization("e", &["scale"]).unwrap();
        assert_eq!(resolved.alternate, Some(0));
        let rate = resolved.canonical[0]
            .substitute(&|_: &String| Some(Expr::<String>::Const(2.)))
            .unwrap();
        assert_eq!(rate.eval_scalar(&NoRefs), 0.5);

        assert_eq!(
            registry.resolve_parameterization("e", &["mean"]).err(),
            Some(RegistryError::UnsupportedParameterization {
                name: "e".to_string(),
                supplied: vec!["mean".to_string()]
            })
        );
    }

    #[test]
    fn builtins_resolve_in_any_order() {
        let registry = Registry::with_builtins();
        let resolved = registry
            .resolve_parameterization("dnorm", &["tau", "mean"])
            .unwrap();
        assert_eq!(resolved.alternate, Some(0));
        assert_eq!(resolved.canonical[0], node("mean"));
        assert!(registry
            .resolve_parameterization("dnorm", &["sd", "mean"])
            .unwrap()
            .alternate
            .is_none());
        assert!(registry.contains("ddirch"));
    }

    #[test]
    fn global_starts_empty_until_registered() {
        let global = Registry::global();
        assert!(std::ptr::eq(global, Registry::global()));
        global.register("graphmc_test_exp", exp_like()).unwrap();
        assert!(global.contains("graphmc_test_exp"));
    }
}
