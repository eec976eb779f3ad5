//! Testing utilities and harness for recompose

pub mod testing;

pub use testing::*;

pub mod prelude {
    pub use crate::testing::*;
    pub use recompose_core::{Operation, TreeApplier};
}
