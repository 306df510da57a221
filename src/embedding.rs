//! 词嵌入层
//!
//! 将离散的 token ID 转换为连续的向量表示。

use ndarray::{Array, Array2, ArrayBase, ArrayD, Axis, Data, Dimension, IxDyn};
use rand::Rng;
use tracing::debug;

use crate::error::{AttentionError, Result};
use crate::optimizer::{Optimizer, Sgd};
use crate::tensor::{dim_as, flatten_leading, random_uniform, unflatten, Scalar};

/// 填充位置使用的 token ID
///
/// 分词器把短序列补齐到固定长度时使用。嵌入层把它当作普通索引处理。
pub const PAD_INDEX: usize = 0;

/// 嵌入层前向缓存
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    /// 展平后的索引
    indices: Vec<usize>,
    /// 原始索引张量形状
    input_shape: Vec<usize>,
}

impl EmbeddingCache {
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

/// 词嵌入层
///
/// 将 token ID 映射到 embedding_dim 维向量
#[derive(Debug, Clone)]
pub struct Embedding<F = f32> {
    /// 权重矩阵: [vocab_size, embedding_dim]
    weights: Array2<F>,
    cache: Option<EmbeddingCache>,
}

impl<F: Scalar> Embedding<F> {
    /// 创建新的嵌入层
    ///
    /// 权重从 U[-1/√embedding_dim, 1/√embedding_dim] 采样。
    pub fn new<R: Rng>(vocab_size: usize, embedding_dim: usize, rng: &mut R) -> Result<Self> {
        if vocab_size == 0 || embedding_dim == 0 {
            return Err(AttentionError::InvalidDimension(format!(
                "Embedding({}, {})",
                vocab_size, embedding_dim
            )));
        }

        let limit = F::one() / dim_as::<F>(embedding_dim).sqrt();

        Ok(Self {
            weights: random_uniform((vocab_size, embedding_dim), limit, rng),
            cache: None,
        })
    }

    /// 用给定权重创建嵌入层
    pub fn from_weights(weights: Array2<F>) -> Result<Self> {
        if weights.is_empty() {
            return Err(AttentionError::InvalidDimension(format!(
                "Embedding 权重形状 {:?}",
                weights.shape()
            )));
        }

        Ok(Self { weights, cache: None })
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn embedding_dim(&self) -> usize {
        self.weights.ncols()
    }

    /// 获取权重（用于可视化或保存）
    pub fn weights(&self) -> &Array2<F> {
        &self.weights
    }

    pub fn param_count(&self) -> usize {
        self.weights.len()
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `x`: 任意形状的 token ID，通常为 [batch_size, seq_len]
    ///
    /// # 输出
    /// - [..x.shape, embedding_dim]
    pub fn forward<S, D>(&mut self, x: &ArrayBase<S, D>) -> Result<Array<F, D::Larger>>
    where
        S: Data<Elem = usize>,
        D: Dimension,
    {
        let (output, cache) = self.forward_cached(x)?;
        self.cache = Some(cache);
        Ok(output)
    }

    /// 前向传播，缓存以返回值的形式交给调用方
    pub fn forward_cached<S, D>(&self, x: &ArrayBase<S, D>) -> Result<(Array<F, D::Larger>, EmbeddingCache)>
    where
        S: Data<Elem = usize>,
        D: Dimension,
    {
        let vocab_size = self.vocab_size();
        let indices: Vec<usize> = x.iter().copied().collect();

        if let Some(&index) = indices.iter().find(|&&index| index >= vocab_size) {
            return Err(AttentionError::IndexOutOfRange { index, vocab_size });
        }

        let gathered = self.weights.select(Axis(0), &indices);

        let mut output_shape = x.shape().to_vec();
        output_shape.push(self.embedding_dim());

        let cache = EmbeddingCache {
            indices,
            input_shape: x.shape().to_vec(),
        };

        Ok((unflatten(gathered, &output_shape)?, cache))
    }

    /// 计算权重梯度（scatter-add）
    ///
    /// 同一个 token 出现多次时，各位置的梯度累加到同一行。
    pub fn gradients<S, E>(&self, cache: &EmbeddingCache, grad_output: &ArrayBase<S, E>) -> Result<Array2<F>>
    where
        S: Data<Elem = F>,
        E: Dimension,
    {
        let mut expected = cache.input_shape.clone();
        expected.push(self.embedding_dim());
        if grad_output.shape() != expected.as_slice() {
            return Err(AttentionError::shape("Embedding::backward", &expected, grad_output.shape()));
        }

        let grad_output = flatten_leading(grad_output)?;
        let mut grad = Array2::zeros(self.weights.dim());

        for (row, &index) in grad_output.outer_iter().zip(&cache.indices) {
            grad.row_mut(index).scaled_add(F::one(), &row);
        }

        Ok(grad)
    }

    /// 反向传播并用 SGD 更新权重
    ///
    /// 返回与输入索引同形状的全零张量：离散索引没有梯度。
    pub fn backward<S, E>(&mut self, grad_output: &ArrayBase<S, E>, lr: F) -> Result<ArrayD<F>>
    where
        S: Data<Elem = F>,
        E: Dimension,
    {
        let cache = self.cache.take().ok_or(AttentionError::MissingCache("Embedding"))?;
        let grad = match self.gradients(&cache, grad_output) {
            Ok(grad) => grad,
            Err(err) => {
                // 梯度形状不对时保留缓存
                self.cache = Some(cache);
                return Err(err);
            }
        };
        self.apply_gradient(&cache, &grad, &mut Sgd::new(lr))
    }

    /// 使用显式缓存和优化器的反向传播
    pub fn backward_cached<S, E, O>(
        &mut self,
        cache: EmbeddingCache,
        grad_output: &ArrayBase<S, E>,
        optimizer: &mut O,
    ) -> Result<ArrayD<F>>
    where
        S: Data<Elem = F>,
        E: Dimension,
        O: Optimizer<F>,
    {
        let grad = self.gradients(&cache, grad_output)?;
        self.apply_gradient(&cache, &grad, optimizer)
    }

    fn apply_gradient<O: Optimizer<F>>(
        &mut self,
        cache: &EmbeddingCache,
        grad: &Array2<F>,
        optimizer: &mut O,
    ) -> Result<ArrayD<F>> {
        debug!(
            tokens = cache.indices.len(),
            vocab_size = self.vocab_size(),
            optimizer = optimizer.name(),
            lr = ?optimizer.lr(),
            "embedding backward"
        );

        optimizer.step(&mut self.weights, grad, "embedding.weight")?;
        Ok(ArrayD::zeros(IxDyn(&cache.input_shape)))
    }
}

/// 将变长 token 序列整理成 [batch_size, max_length] 的索引矩阵
///
/// 过长的序列被截断，过短的序列在末尾补 `pad_index`。
pub fn pad_batch<T: AsRef<[usize]>>(sequences: &[T], max_length: usize, pad_index: usize) -> Array2<usize> {
    Array2::from_shape_fn((sequences.len(), max_length), |(i, j)| {
        sequences[i].as_ref().get(j).copied().unwrap_or(pad_index)
    })
}
