pub mod errors;
pub mod link;
pub mod model;
pub mod prior;
pub mod result;

pub use errors::*;
pub use link::*;
pub use model::*;
pub use prior::*;
pub use result::*;
