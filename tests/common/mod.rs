#[macro_use]
pub mod helpers;
