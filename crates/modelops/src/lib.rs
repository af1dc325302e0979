pub mod schema;
pub mod store;
pub mod ports;
pub mod programs;

pub use schema::*;
pub use store::*;
pub use ports::*;
pub use programs::*;
