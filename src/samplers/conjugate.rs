//! Gibbs updates from closed-form full conditionals.
//!
//! A target is conjugate when every stochastic dependent uses it directly,
//! without any deterministic transformation, as the one parameter that the
//! prior is conjugate for.

use rand::RngCore;

use crate::{
    expr::Expr,
    graph::{ModelGraph, NodeId, NodeValues},
    samplers::Blanket,
    specialize::{AlgorithmTemplate, RunError, RunOutcome, SamplerStats, Setup, SpecializeError, Specialized},
};

/// The conjugate prior families that can be updated exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjugacy {
    /// Beta prior on the probability of `dbern` or `dbin` dependents.
    Beta,
    /// Gamma prior on a `dpois` mean, a `dexp` or `dgamma` rate, or a
    /// `dnorm` precision.
    Gamma,
    /// Normal prior on the mean of `dnorm` dependents.
    Normal,
    /// Dirichlet prior on the probabilities of `dcat` dependents.
    Dirichlet,
}

/// How one dependent contributes to the posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Bernoulli,
    Binomial,
    Poisson,
    Exponential,
    GammaRate,
    NormalPrecision,
    NormalMean,
    Categorical,
}

fn is_ref(expr: &Expr<NodeId>, target: NodeId) -> bool {
    matches!(expr, Expr::Ref(id) if *id == target)
}

fn is_precision_of(expr: &Expr<NodeId>, target: NodeId) -> bool {
    *expr == 1. / Expr::Ref(target).sqrt()
}

fn link(graph: &ModelGraph, prior: Conjugacy, target: NodeId, dependent: NodeId) -> Option<Link> {
    let def = graph.node(dependent).stochastic()?;
    let params = &def.params;
    // Index of the parameter that carries the target, and the link.
    let (pos, link) = match (prior, def.distribution.name()) {
        (Conjugacy::Beta, "dbern") => (0, Link::Bernoulli),
        (Conjugacy::Beta, "dbin") => (0, Link::Binomial),
        (Conjugacy::Gamma, "dpois") => (0, Link::Poisson),
        (Conjugacy::Gamma, "dexp") => (0, Link::Exponential),
        (Conjugacy::Gamma, "dgamma") => (1, Link::GammaRate),
        (Conjugacy::Gamma, "dnorm") if is_precision_of(&params[1], target) => (1, Link::NormalPrecision),
        (Conjugacy::Normal, "dnorm") => (0, Link::NormalMean),
        (Conjugacy::Dirichlet, "dcat") => (0, Link::Categorical),
        _ => return None,
    };
    if link != Link::NormalPrecision && !is_ref(&params[pos], target) {
        return None;
    }
    let elsewhere = params
        .iter()
        .enumerate()
        .any(|(i, p)| i != pos && p.refs().contains(&&target));
    if elsewhere {
        return None;
    }
    if link != Link::Categorical && graph.node(dependent).shape.len() != 1 {
        return None;
    }
    Some(link)
}

impl Conjugacy {
    /// Detect a conjugate relationship between `target` and all of its
    /// stochastic dependents.
    pub fn detect(graph: &ModelGraph, target: NodeId) -> Option<Conjugacy> {
        Self::links(graph, target).map(|(prior, _)| prior)
    }

    fn links(graph: &ModelGraph, target: NodeId) -> Option<(Conjugacy, Vec<(NodeId, Link)>)> {
        let node = graph.node(target);
        if node.is_data() {
            return None;
        }
        let prior = match node.distribution()?.name() {
            "dbeta" => Conjugacy::Beta,
            "dgamma" => Conjugacy::Gamma,
            "dnorm" => Conjugacy::Normal,
            "ddirch" => Conjugacy::Dirichlet,
            _ => return None,
        };
        let scalar = node.shape.len() == 1;
        if scalar == (prior == Conjugacy::Dirichlet) {
            return None;
        }
        let links = graph
            .stochastic_dependents(target)
            .into_iter()
            .map(|dep| link(graph, prior, target, dep).map(|l| (dep, l)))
            .collect::<Option<Vec<_>>>()?;
        Some((prior, links))
    }
}

/// Samples a target from its conjugate full conditional.
#[derive(Debug, Clone, Copy, Default)]
pub struct Conjugate;

struct ConjugateSampler {
    blanket: Blanket,
    target: NodeId,
    prior: Conjugacy,
    links: Vec<(NodeId, Link)>,
    posterior: Vec<Vec<f64>>,
    updates: u64,
}

impl AlgorithmTemplate for Conjugate {
    fn name(&self) -> &str {
        "conjugate"
    }

    fn setup(&self, setup: &mut Setup, targets: &[String]) -> Result<Box<dyn Specialized>, SpecializeError> {
        let ids = setup.resolve_all(targets)?;
        let &[target] = ids.as_slice() else {
            return Err(SpecializeError::ShapeIncompatible {
                algorithm: self.name().to_string(),
                node: targets.join(", "),
                reason: "needs exactly one target node".to_string(),
            });
        };
        setup.require_sampleable(self.name(), target)?;
        let graph = setup.graph().clone();
        let Some((prior, links)) = Conjugacy::links(&graph, target) else {
            return Err(SpecializeError::ShapeIncompatible {
                algorithm: self.name().to_string(),
                node: graph.node(target).name.clone(),
                reason: "no conjugate relationship with its dependents".to_string(),
            });
        };
        log::debug!(
            "{:?} conjugacy for '{}' over {} dependents",
            prior,
            graph.node(target).name,
            links.len()
        );
        let len = graph.node(target).shape.len();
        let posterior = match prior {
            Conjugacy::Dirichlet => vec![vec![0.; len]],
            _ => vec![vec![0.]; 2],
        };
        Ok(Box::new(ConjugateSampler {
            blanket: Blanket::new(setup, ids),
            target,
            prior,
            links,
            posterior,
            updates: 0,
        }))
    }
}

impl ConjugateSampler {
    /// Fill `posterior` with the canonical parameters of the full
    /// conditional, given current values.
    fn update_posterior(&mut self, values: &mut NodeValues) {
        let graph = self.blanket.graph.clone();
        for (post, prior) in self
            .posterior
            .iter_mut()
            .zip(graph.param_values(values, self.target))
        {
            post.copy_from_slice(prior);
        }
        if self.prior == Conjugacy::Normal {
            // Work in (precision-weighted mean, precision) and convert back.
            let (mean, sd) = (self.posterior[0][0], self.posterior[1][0]);
            self.posterior[1][0] = 1. / (sd * sd);
            self.posterior[0][0] = mean * self.posterior[1][0];
        }

        for &(dep, link) in self.links.iter() {
            let x = values.get(graph.node(dep))[0];
            match link {
                Link::Bernoulli => {
                    self.posterior[0][0] += x;
                    self.posterior[1][0] += 1. - x;
                }
                Link::Binomial => {
                    let size = graph.param_values(values, dep)[1][0];
                    self.posterior[0][0] += x;
                    self.posterior[1][0] += size - x;
                }
                Link::Poisson => {
                    self.posterior[0][0] += x;
                    self.posterior[1][0] += 1.;
                }
                Link::Exponential => {
                    self.posterior[0][0] += 1.;
                    self.posterior[1][0] += x;
                }
                Link::GammaRate => {
                    let shape = graph.param_values(values, dep)[0][0];
                    self.posterior[0][0] += shape;
                    self.posterior[1][0] += x;
                }
                Link::NormalPrecision => {
                    let mean = graph.param_values(values, dep)[0][0];
                    self.posterior[0][0] += 0.5;
                    self.posterior[1][0] += 0.5 * (x - mean) * (x - mean);
                }
                Link::NormalMean => {
                    let sd = graph.param_values(values, dep)[1][0];
                    let precision = 1. / (sd * sd);
                    self.posterior[0][0] += x * precision;
                    self.posterior[1][0] += precision;
                }
                Link::Categorical => {
                    let k = x as usize;
                    if let Some(alpha) = k.checked_sub(1).and_then(|i| self.posterior[0].get_mut(i)) {
                        *alpha += 1.;
                    }
                }
            }
        }

        if self.prior == Conjugacy::Normal {
            let precision = self.posterior[1][0];
            self.posterior[0][0] /= precision;
            self.posterior[1][0] = 1. / precision.sqrt();
        }
    }
}

impl Specialized for ConjugateSampler {
    fn name(&self) -> &str {
        "conjugate"
    }

    fn targets(&self) -> &[NodeId] {
        &self.blanket.targets
    }

    fn run(&mut self, values: &mut NodeValues, rng: &mut dyn RngCore) -> Result<RunOutcome, RunError> {
        self.update_posterior(values);
        let graph = self.blanket.graph.clone();
        let node = graph.node(self.target);
        let params: Vec<&[f64]> = self.posterior.iter().map(|p| p.as_slice()).collect();
        if let Some(dist) = node.distribution() {
            dist.sample(&params, rng, values.get_mut(node));
        }
        log::trace!("conjugate update of '{}' with {:?}", node.name, self.posterior);
        self.blanket.calculate(values);
        self.updates += 1;
        Ok(RunOutcome::Updated)
    }

    fn stats(&self) -> SamplerStats {
        SamplerStats::new(self.updates, self.updates, None)
    }

    fn reset(&mut self) {
        self.updates = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expr::node,
        graph::Relation,
        samplers::test_util::{build, draws, instance, mean},
        shape::Shape,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn scalar(name: &str, dist: &str, params: Vec<(&str, Expr<String>)>) -> Relation {
        Relation::stochastic(name, Shape::scalar(), dist, params)
    }

    #[test]
    fn detects_supported_pairs() {
        let graph = build(vec![
            scalar("p", "dbeta", vec![("shape1", 1.0.into()), ("shape2", 1.0.into())]),
            scalar("y", "dbin", vec![("prob", node("p")), ("size", 10.0.into())]).observed(vec![3.]),
            scalar("tau", "dgamma", vec![("shape", 1.0.into()), ("rate", 1.0.into())]),
            scalar("mu", "dnorm", vec![("mean", 0.0.into()), ("sd", 10.0.into())]),
            scalar("z", "dnorm", vec![("mean", node("mu")), ("tau", node("tau"))]).observed(vec![0.5]),
            scalar("q", "dbeta", vec![("shape1", 1.0.into()), ("shape2", 1.0.into())]),
            scalar("w", "dbern", vec![("prob", node("q") * 0.5)]).observed(vec![1.]),
        ]);
        let id = |name| graph.node_id(name).unwrap();
        assert_eq!(Conjugacy::detect(&graph, id("p")), Some(Conjugacy::Beta));
        assert_eq!(Conjugacy::detect(&graph, id("tau")), Some(Conjugacy::Gamma));
        assert_eq!(Conjugacy::detect(&graph, id("mu")), Some(Conjugacy::Normal));
        // scaled probability is not conjugate
        assert_eq!(Conjugacy::detect(&graph, id("q")), None);
        assert_eq!(Conjugacy::detect(&graph, id("y")), None);

        let mut setup = Setup::new(graph.clone());
        assert!(matches!(
            setup.specialize(&Conjugate, &["q".to_string()]),
            Err(SpecializeError::ShapeIncompatible { .. })
        ));
    }

    #[test]
    fn target_in_two_parameters_is_not_conjugate() {
        let graph = build(vec![
            scalar("mu", "dnorm", vec![("mean", 0.0.into()), ("sd", 1.0.into())]),
            scalar("y", "dnorm", vec![("mean", node("mu")), ("sd", node("mu").exp())]).observed(vec![1.]),
        ]);
        assert_eq!(Conjugacy::detect(&graph, graph.node_id("mu").unwrap()), None);
    }

    #[test]
    fn beta_binomial_posterior_mean() {
        let graph = build(vec![
            scalar("p", "dbeta", vec![("shape1", 2.0.into()), ("shape2", 3.0.into())]),
            scalar("y", "dbin", vec![("prob", node("p")), ("size", 20.0.into())]).observed(vec![12.]),
        ]);
        let mut sampler = instance(&graph, &Conjugate, &["p"]);
        let mut values = graph.new_values();
        let draws = draws(&graph, &mut values, sampler.as_mut(), "p", 20_000, 9);
        // Beta(2 + 12, 3 + 8)
        assert_abs_diff_eq!(mean(&draws), 14. / 25., epsilon = 0.01);
        assert!(values.cached_logprob(graph.node_id("y").unwrap()).is_finite());
    }

    #[test]
    fn gamma_poisson_and_normal_precision() {
        let graph = build(vec![
            scalar("lambda", "dgamma", vec![("shape", 1.0.into()), ("rate", 1.0.into())]),
            scalar("a", "dpois", vec![("lambda", node("lambda"))]).observed(vec![4.]),
            scalar("b", "dpois", vec![("lambda", node("lambda"))]).observed(vec![6.]),
            scalar("tau", "dgamma", vec![("shape", 2.0.into()), ("rate", 1.0.into())]),
            scalar("x", "dnorm", vec![("mean", 1.0.into()), ("tau", node("tau"))]).observed(vec![3.]),
        ]);
        let mut sampler = instance(&graph, &Conjugate, &["lambda"]);
        let mut values = graph.new_values();
        let lambda = draws(&graph, &mut values, sampler.as_mut(), "lambda", 20_000, 4);
        // Gamma(1 + 10, 1 + 2)
        assert_abs_diff_eq!(mean(&lambda), 11. / 3., epsilon = 0.05);

        let mut sampler = instance(&graph, &Conjugate, &["tau"]);
        let tau = draws(&graph, &mut values, sampler.as_mut(), "tau", 20_000, 4);
        // Gamma(2 + 0.5, 1 + 0.5 * 4)
        assert_abs_diff_eq!(mean(&tau), 2.5 / 3., epsilon = 0.02);
    }

    #[test]
    fn normal_mean_and_dirichlet_counts() {
        let graph = build(vec![
            scalar("mu", "dnorm", vec![("mean", 0.0.into()), ("sd", 1.0.into())]),
            scalar("y1", "dnorm", vec![("mean", node("mu")), ("sd", 1.0.into())]).observed(vec![2.]),
            scalar("y2", "dnorm", vec![("mean", node("mu")), ("sd", 1.0.into())]).observed(vec![4.]),
            Relation::stochastic("pi", Shape::vector(3), "ddirch", [("alpha", vec![1., 1., 1.].into())]),
            scalar("c1", "dcat", vec![("prob", node("pi"))]).observed(vec![1.]),
            scalar("c2", "dcat", vec![("prob", node("pi"))]).observed(vec![1.]),
            scalar("c3", "dcat", vec![("prob", node("pi"))]).observed(vec![3.]),
        ]);
        let mut sampler = instance(&graph, &Conjugate, &["mu"]);
        let mut values = graph.new_values();
        let mu = draws(&graph, &mut values, sampler.as_mut(), "mu", 20_000, 8);
        // precision 3, mean 6 / 3
        assert_abs_diff_eq!(mean(&mu), 2., epsilon = 0.02);

        let pi = graph.node_id("pi").unwrap();
        assert_eq!(Conjugacy::detect(&graph, pi), Some(Conjugacy::Dirichlet));
        let mut sampler = instance(&graph, &Conjugate, &["pi"]);
        let first = draws(&graph, &mut values, sampler.as_mut(), "pi", 20_000, 8);
        // Dirichlet(3, 1, 2)
        assert_abs_diff_eq!(mean(&first), 0.5, epsilon = 0.01);
        let sum: f64 = values.get(graph.node(pi)).iter().sum();
        assert_abs_diff_eq!(sum, 1., epsilon = 1e-9);
    }
}
