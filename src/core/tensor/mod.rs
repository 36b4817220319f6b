mod dtype;
mod tensor;
mod ops;
mod views;

pub use dtype::{ComputeDType, DType, Shape};
pub use tensor::{Storage, Tensor};
pub use tensor::f32_vec_to_bytes;
