//! Parent-side container handle.

mod container;
mod state;

pub use container::Kitten;
pub use state::{ContainerStatus, KittenInfo};
