pub mod apply;
pub mod delete;
