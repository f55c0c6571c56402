//! Serializable configuration of an oversubscribed training session.

mod machine_learning;
mod mos;
mod session;
mod solver;

pub use machine_learning::{DistributionSpec, InitializerSpec, OptimizerSpec};
pub use mos::{EvictionSpec, MosSpec};
pub use session::{FitSpec, ReaderSpec, SessionSpec};
pub use solver::SolverSpec;
