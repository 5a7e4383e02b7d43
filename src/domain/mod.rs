pub mod record;
pub mod site;

pub use record::*;
pub use site::*;
