pub mod identifiers;
pub mod path;
pub mod result;

pub use identifiers::*;
pub use path::*;
pub use result::*;
