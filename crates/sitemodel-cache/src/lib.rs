pub mod derived;
pub mod driver;
pub mod tagged;

pub use derived::*;
pub use driver::*;
pub use tagged::*;
