#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod arena;
mod array;
mod component;
mod composite;
mod core;
mod definition;
mod deps;
mod error;
mod evaluator;
mod inverse;
mod queue;
mod registry;
mod render;
mod resolver;
mod serialized;
mod shadow;
mod staleness;
mod state;
mod value;

pub use arena::*;
pub use array::*;
pub use component::*;
pub use composite::*;
pub use self::core::*;
pub use definition::*;
pub use deps::*;
pub use error::*;
pub use queue::*;
pub use registry::*;
pub use render::*;
pub use resolver::*;
pub use serialized::*;
pub use state::*;
pub use value::*;
