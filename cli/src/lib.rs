pub mod render;
pub mod simulate;
