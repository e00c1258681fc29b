//! Request handlers for the two job kinds.

pub mod correctness;
pub mod load;

pub use correctness::CorrectnessTest;
pub use load::LoadTest;
