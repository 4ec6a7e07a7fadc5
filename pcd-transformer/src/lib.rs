pub mod error;
pub mod filter;
pub mod transform;

pub use error::{FilterError, TransformError};
pub use filter::{Criterion, FilterChain};
pub use transform::{Operation, TransformPipeline};
