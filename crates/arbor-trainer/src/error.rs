//! Conversion of numeric backend failures into [`ArborError`].

use arbor_core::{ArborError, Result};

/// Maps a candle result into the crate-wide error type.
pub trait ModelResultExt<T> {
    fn model_err(self) -> Result<T>;
}

impl<T> ModelResultExt<T> for candle_core::Result<T> {
    fn model_err(self) -> Result<T> {
        self.map_err(|e| ArborError::Model(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn candle_errors_become_model_errors() {
        let a = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((4, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = a.matmul(&b).model_err().unwrap_err();
        assert!(matches!(err, ArborError::Model(_)));
    }
}
