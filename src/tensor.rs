//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现注意力所需的批量矩阵乘法、softmax、展平与参数初始化。

use ndarray::linalg::general_mat_mul;
use ndarray::{Array, Array2, Array3, ArrayBase, ArrayView3, Axis, Data, Dimension, Ix3, IxDyn, NdFloat};
use rand::distributions::uniform::SampleUniform;
use rand::Rng;

use crate::error::{AttentionError, Result};

/// 张量元素类型（f32 或 f64）
pub trait Scalar: NdFloat + SampleUniform {}

impl<T: NdFloat + SampleUniform> Scalar for T {}

/// 将维度大小转换为浮点标量
pub(crate) fn dim_as<F: Scalar>(n: usize) -> F {
    num_traits::cast(n).unwrap_or_else(F::nan)
}

/// Xavier/Glorot 均匀初始化的边界
///
/// ```text
/// limit = √(6 / (fan_in + fan_out))
/// ```
pub fn xavier_limit<F: Scalar>(fan_in: usize, fan_out: usize) -> F {
    (dim_as::<F>(6) / dim_as::<F>(fan_in + fan_out)).sqrt()
}

/// 从 U[-limit, limit] 采样矩阵
pub fn random_uniform<F: Scalar, R: Rng>(shape: (usize, usize), limit: F, rng: &mut R) -> Array2<F> {
    Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..=limit))
}

/// 展平除最后一维外的所有维度: (..., n) → (rows, n)
///
/// 行顺序与逻辑（行优先）顺序一致，与输入的内存布局无关。
pub fn flatten_leading<F, S, D>(x: &ArrayBase<S, D>) -> Result<Array2<F>>
where
    F: Scalar,
    S: Data<Elem = F>,
    D: Dimension,
{
    let shape = x.shape();
    let (&cols, leading) = shape.split_last().ok_or_else(|| {
        AttentionError::InvalidDimension("0 维张量没有特征轴".to_string())
    })?;
    let rows = leading.iter().product::<usize>();

    Ok(Array2::from_shape_vec((rows, cols), x.iter().copied().collect())?)
}

/// `flatten_leading` 的逆操作：恢复为指定形状和维度类型
pub fn unflatten<F: Scalar, D: Dimension>(x: Array2<F>, shape: &[usize]) -> Result<Array<F, D>> {
    let x = if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().into_owned()
    };
    Ok(x.into_shape(IxDyn(shape))?.into_dimensionality::<D>()?)
}

/// 三维张量 (batch, rows, cols) 的扩展操作
pub trait TensorExt<F: Scalar> {
    /// 批量矩阵乘法: (b, n, k) × (b, k, m) → (b, n, m)
    fn bmm<S2: Data<Elem = F>>(&self, other: &ArrayBase<S2, Ix3>) -> Result<Array3<F>>;

    /// 交换最后两个轴（逐批转置），返回视图
    fn transpose_last(&self) -> ArrayView3<'_, F>;

    /// 沿最后一个轴的 softmax
    fn softmax_last(&self) -> Array3<F>;

    /// 沿最后一个轴求和，保留该轴（长度为 1）
    fn sum_last_keepdims(&self) -> Array3<F>;
}

impl<F: Scalar, S: Data<Elem = F>> TensorExt<F> for ArrayBase<S, Ix3> {
    fn bmm<S2: Data<Elem = F>>(&self, other: &ArrayBase<S2, Ix3>) -> Result<Array3<F>> {
        let (batch, n, k) = self.dim();
        let (other_batch, other_k, m) = other.dim();

        if batch != other_batch || k != other_k {
            return Err(AttentionError::shape("bmm", &[batch, k, m], other.shape()));
        }

        let mut out = Array3::zeros((batch, n, m));
        for ((a, b), mut c) in self
            .outer_iter()
            .zip(other.outer_iter())
            .zip(out.outer_iter_mut())
        {
            general_mat_mul(F::one(), &a, &b, F::zero(), &mut c);
        }

        Ok(out)
    }

    fn transpose_last(&self) -> ArrayView3<'_, F> {
        self.view().permuted_axes([0, 2, 1])
    }

    fn softmax_last(&self) -> Array3<F> {
        let axis = Axis(2);

        // 减去每行最大值，避免 exp 溢出
        let max = self
            .fold_axis(axis, F::neg_infinity(), |&a, &b| a.max(b))
            .insert_axis(axis);
        let exp = (self - &max).mapv(|v| v.exp());
        let sum = exp.sum_axis(axis).insert_axis(axis);

        exp / &sum
    }

    fn sum_last_keepdims(&self) -> Array3<F> {
        self.sum_axis(Axis(2)).insert_axis(Axis(2))
    }
}
