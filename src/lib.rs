pub(crate) mod assembly;
pub(crate) mod deps;
pub(crate) mod distribution;
pub mod distributions;
pub mod expr;
pub(crate) mod graph;
pub mod math;
pub(crate) mod mcmc;
pub(crate) mod registry;
pub mod samplers;
pub(crate) mod shape;
pub(crate) mod specialize;

pub use assembly::{AssemblyError, DefaultSamplerMapping, McmcConfiguration, Pipeline, SamplerConf, SamplerMapping};
pub use deps::{DependencyOptions, DependencySet, Direction};
pub use distribution::{
    CustomDistribution, DensityFn, Distribution, DistributionDescriptor, Family, ParamSpec, Parameterization, Rank,
    SampleFn, Support,
};
pub use expr::{Expr, ExprError};
pub use graph::{
    GraphEnv, GraphError, Model, ModelGraph, Node, NodeId, NodeKind, NodeValues, Relation, RelationKind,
    StochasticDef,
};
pub use mcmc::{run_chain, run_chains, Chain, ChainOutput, McmcSettings, Progress, Trace};
pub use registry::{register_builtins, Registry, RegistryError, ResolvedParams};
pub use shape::Shape;
pub use specialize::{
    AlgorithmTemplate, LogProb, LogProbTemplate, Objective, ObjectiveTemplate, RunError, RunOutcome, SamplerStats,
    Scratch, Setup, SpecializeError, Specialized,
};
