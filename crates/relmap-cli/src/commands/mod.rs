pub mod demo;
pub mod explain;
pub mod seed;
