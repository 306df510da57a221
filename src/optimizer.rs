//! 优化器
//!
//! 各模块的 backward 通过这里更新自身参数。只提供普通 SGD。

use ndarray::Array2;

use crate::error::{AttentionError, Result};
use crate::tensor::Scalar;

/// 优化器 trait
pub trait Optimizer<F: Scalar> {
    /// 按梯度原地更新参数
    ///
    /// 参数与梯度形状必须完全一致，不做广播。
    fn step(&mut self, param: &mut Array2<F>, grad: &Array2<F>, param_name: &str) -> Result<()>;

    /// 获取当前学习率
    fn lr(&self) -> F;

    /// 优化器名称
    fn name(&self) -> &str;
}

/// SGD（随机梯度下降）
///
/// ```text
/// param = param - lr * grad
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Sgd<F> {
    lr: F,
}

impl<F: Scalar> Sgd<F> {
    pub fn new(lr: F) -> Self {
        Self { lr }
    }
}

impl<F: Scalar> Optimizer<F> for Sgd<F> {
    fn step(&mut self, param: &mut Array2<F>, grad: &Array2<F>, _param_name: &str) -> Result<()> {
        if param.shape() != grad.shape() {
            return Err(AttentionError::shape("Sgd::step", param.shape(), grad.shape()));
        }

        param.zip_mut_with(grad, |p, &g| *p = *p - g * self.lr);
        Ok(())
    }

    fn lr(&self) -> F {
        self.lr
    }

    fn name(&self) -> &str {
        "SGD"
    }
}
