pub mod decoder;
pub mod error;
pub mod factory;
pub mod index;
pub mod reader;
pub mod region;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{ConfigError, ReaderError};
pub use factory::{ReaderConfiguration, ReaderFactory};
pub use reader::PointReader;
pub use region::QueryRegion;
