#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod matrix;
pub mod synthdata;

pub mod estimate;
pub mod model;
pub mod posterior;
pub mod reestimate;
pub mod sparsity;
