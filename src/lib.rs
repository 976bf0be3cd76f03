pub mod dense;
pub mod eigen;
pub mod pv;
pub mod volume;
mod utils;

pub use dense::{mean_vector, ColumnMajor, ColumnSet, ColumnSource};
pub use pv::{
    principal_vector, principal_vector_pair, PrincipalVectors, PrincipalVectorsBuilder, PvConfig,
    Workspace,
};
pub use utils::FloatOps;
