pub mod critical;
pub mod digital;
