//! Graph-level machinery for neural-network training: reverse-mode gradient
//! graph construction over an operator-level compute graph, loss attachment,
//! and single-node / data-parallel / ZeRO optimizer graph construction with
//! mixed-precision and gradient-accumulation support.
//!
//! The crate builds and transforms graphs; execution is delegated to whatever
//! runtime consumes them. A small reference [`interpreter`] exists so the
//! builders can be validated numerically (see [`checker`]).

pub mod accumulation;
pub mod checker;
pub mod distributed;
pub mod dtype;
pub mod gradients;
pub mod graph;
pub mod interpreter;
pub mod loss;
pub mod loss_scaler;
pub mod optimizer;
pub mod session;
pub mod tensor;

pub use dtype::DType;
pub use gradients::{
    GradientBuildResult, GradientGraphBuilder, GradientGraphConfig, LossScale,
};
pub use graph::{Graph, GraphMutator, NodeDef};
pub use loss::{LossFunction, Reduction};
pub use loss_scaler::LossScaler;
pub use optimizer::{
    OptimizerAlgorithm, OptimizerBuildResult, OptimizerGraphBuilder, OptimizerGraphConfig,
    OptimizerNodeConfig,
};
pub use session::{SaveOption, TrainingSession};
pub use tensor::TensorValue;
