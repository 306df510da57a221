//! 可训练的线性层
//!
//! ```text
//! y = xW + b
//! ```
//!
//! 输入可以有任意多个前导维度（batch，或 batch + seq）。反向传播时把所有
//! 前导维度展平成一个行轴，再统一做 `Xᵀ · dY`，因此二维和三维输入走的是
//! 同一条收缩规则。

use ndarray::{Array, Array2, ArrayBase, Axis, Data, Dimension};
use rand::Rng;
use tracing::debug;

use crate::error::{AttentionError, Result};
use crate::optimizer::{Optimizer, Sgd};
use crate::tensor::{flatten_leading, random_uniform, unflatten, xavier_limit, Scalar};

/// 线性层前向缓存
#[derive(Debug, Clone)]
pub struct LinearCache<F> {
    /// 展平后的输入: [rows, in_features]
    input: Array2<F>,
    /// 原始输入形状
    input_shape: Vec<usize>,
}

impl<F> LinearCache<F> {
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }
}

/// 线性层梯度
#[derive(Debug, Clone)]
pub struct LinearGrads<F> {
    /// 展平后的输入梯度: [rows, in_features]
    pub input: Array2<F>,
    /// 权重梯度: [in_features, out_features]
    pub weight: Array2<F>,
    /// 偏置梯度: [1, out_features]
    pub bias: Array2<F>,
}

/// 可训练的线性层
#[derive(Debug, Clone)]
pub struct Linear<F = f32> {
    /// 权重: [in_features, out_features]
    weight: Array2<F>,
    /// 偏置: [1, out_features]
    bias: Array2<F>,
    /// 最近一次 forward 的缓存
    cache: Option<LinearCache<F>>,
}

impl<F: Scalar> Linear<F> {
    /// 创建线性层
    ///
    /// 权重使用 Xavier 均匀初始化，偏置为 0。
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(AttentionError::InvalidDimension(format!(
                "Linear({}, {})",
                in_features, out_features
            )));
        }

        let limit = xavier_limit(in_features, out_features);

        Ok(Self {
            weight: random_uniform((in_features, out_features), limit, rng),
            bias: Array2::zeros((1, out_features)),
            cache: None,
        })
    }

    /// 用给定参数创建线性层（用于测试或加载权重）
    pub fn from_parts(weight: Array2<F>, bias: Array2<F>) -> Result<Self> {
        let (in_features, out_features) = weight.dim();
        if in_features == 0 || out_features == 0 {
            return Err(AttentionError::InvalidDimension(format!(
                "Linear 权重形状 {:?}",
                weight.shape()
            )));
        }
        if bias.dim() != (1, out_features) {
            return Err(AttentionError::shape("Linear::from_parts", &[1, out_features], bias.shape()));
        }

        Ok(Self {
            weight,
            bias,
            cache: None,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn weight(&self) -> &Array2<F> {
        &self.weight
    }

    pub fn bias(&self) -> &Array2<F> {
        &self.bias
    }

    /// 获取参数数量
    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// 前向传播，缓存输入供下一次 `backward` 使用
    ///
    /// 输入: [..., in_features]
    /// 输出: [..., out_features]
    pub fn forward<S, D>(&mut self, x: &ArrayBase<S, D>) -> Result<Array<F, D>>
    where
        S: Data<Elem = F>,
        D: Dimension,
    {
        let (output, cache) = self.forward_cached(x)?;
        self.cache = Some(cache);
        Ok(output)
    }

    /// 前向传播，缓存以返回值的形式交给调用方
    pub fn forward_cached<S, D>(&self, x: &ArrayBase<S, D>) -> Result<(Array<F, D>, LinearCache<F>)>
    where
        S: Data<Elem = F>,
        D: Dimension,
    {
        let in_features = self.in_features();
        if x.shape().last() != Some(&in_features) {
            let mut expected = x.shape().to_vec();
            match expected.last_mut() {
                Some(last) => *last = in_features,
                None => expected.push(in_features),
            }
            return Err(AttentionError::shape("Linear::forward", &expected, x.shape()));
        }

        let input = flatten_leading(x)?;
        let output = input.dot(&self.weight) + &self.bias;

        let mut output_shape = x.shape().to_vec();
        if let Some(last) = output_shape.last_mut() {
            *last = self.out_features();
        }

        let cache = LinearCache {
            input,
            input_shape: x.shape().to_vec(),
        };

        Ok((unflatten(output, &output_shape)?, cache))
    }

    /// 计算梯度，不修改参数
    ///
    /// ```text
    /// dW = Σ_leading xᵀ · dy
    /// db = Σ_leading dy
    /// dx = dy · Wᵀ
    /// ```
    pub fn gradients<S, D>(&self, cache: &LinearCache<F>, grad_output: &ArrayBase<S, D>) -> Result<LinearGrads<F>>
    where
        S: Data<Elem = F>,
        D: Dimension,
    {
        let mut expected = cache.input_shape.clone();
        if let Some(last) = expected.last_mut() {
            *last = self.out_features();
        }
        if grad_output.shape() != expected.as_slice() {
            return Err(AttentionError::shape("Linear::backward", &expected, grad_output.shape()));
        }

        let grad_output = flatten_leading(grad_output)?;

        let weight = cache.input.t().dot(&grad_output);
        let bias = grad_output.sum_axis(Axis(0)).insert_axis(Axis(0));
        let input = grad_output.dot(&self.weight.t());

        Ok(LinearGrads { input, weight, bias })
    }

    /// 更新参数
    pub fn update<O: Optimizer<F>>(&mut self, grads: &LinearGrads<F>, optimizer: &mut O) -> Result<()> {
        optimizer.step(&mut self.weight, &grads.weight, "linear.weight")?;
        optimizer.step(&mut self.bias, &grads.bias, "linear.bias")
    }

    /// 反向传播并用 SGD 更新参数
    ///
    /// 输入: grad_output [..., out_features]
    /// 返回: grad_input [..., in_features]
    ///
    /// `grad_output` 形状不对时返回错误，缓存保留，可以用正确的梯度重试。
    pub fn backward<S, D>(&mut self, grad_output: &ArrayBase<S, D>, lr: F) -> Result<Array<F, D>>
    where
        S: Data<Elem = F>,
        D: Dimension,
    {
        let cache = self.cache.as_ref().ok_or(AttentionError::MissingCache("Linear"))?;
        let grads = self.gradients(cache, grad_output)?;
        let rows = cache.input.nrows();
        let input_shape = cache.input_shape.clone();

        self.cache = None;
        self.apply_gradients(grads, rows, &input_shape, &mut Sgd::new(lr))
    }

    /// 使用显式缓存和优化器的反向传播
    pub fn backward_cached<S, D, O>(
        &mut self,
        cache: LinearCache<F>,
        grad_output: &ArrayBase<S, D>,
        optimizer: &mut O,
    ) -> Result<Array<F, D>>
    where
        S: Data<Elem = F>,
        D: Dimension,
        O: Optimizer<F>,
    {
        let grads = self.gradients(&cache, grad_output)?;
        self.apply_gradients(grads, cache.input.nrows(), &cache.input_shape, optimizer)
    }

    fn apply_gradients<D, O>(
        &mut self,
        grads: LinearGrads<F>,
        rows: usize,
        input_shape: &[usize],
        optimizer: &mut O,
    ) -> Result<Array<F, D>>
    where
        D: Dimension,
        O: Optimizer<F>,
    {
        debug!(
            rows,
            in_features = self.in_features(),
            out_features = self.out_features(),
            optimizer = optimizer.name(),
            lr = ?optimizer.lr(),
            "linear backward"
        );

        // dx 用更新前的权重计算
        self.update(&grads, optimizer)?;
        unflatten(grads.input, input_shape)
    }
}
