pub mod assistant;
pub mod errors;
pub mod session;
pub mod traits;
