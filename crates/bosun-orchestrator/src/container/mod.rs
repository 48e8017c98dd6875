//! Container descriptions and observed state.

mod spec;
mod state;

pub use spec::{ContainerSpec, ImageReference, LABEL_MANAGED, LABEL_ROLE, LABEL_SERVICE};
pub use state::ContainerState;
