mod adopted_resource;
mod common;
mod scalable_target;
mod scaling_policy;

pub use adopted_resource::*;
pub use common::*;
pub use scalable_target::*;
pub use scaling_policy::*;
