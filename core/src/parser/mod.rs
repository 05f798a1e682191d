pub mod bridge;
pub mod extract;
