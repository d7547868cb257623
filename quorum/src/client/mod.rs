//! This module holds entities that represent the whole driver to the user:
//! the [`Dispatcher`] and the [`DispatcherBuilder`] used to configure and create it.

mod dispatcher;
mod dispatcher_builder;

pub use dispatcher::{Dispatcher, DispatcherConfig, KnownNode};
pub use dispatcher_builder::DispatcherBuilder;

pub use crate::frame::Compression;
pub use crate::network::PoolSize;
