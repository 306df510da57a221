//! 缩放点积注意力与自注意力
//!
//! ```text
//! Attention(Q, K, V) = softmax(QKᵀ / √d_k) V
//! ```
//!
//! 反向传播全部手工推导，不依赖自动求导。

use ndarray::{Array3, ArrayBase, Data, Ix3};
use rand::Rng;
use tracing::{debug, trace};

use crate::error::{AttentionError, Result};
use crate::linear::{Linear, LinearCache};
use crate::optimizer::{Optimizer, Sgd};
use crate::tensor::{dim_as, Scalar, TensorExt};

/// (dQ, dK, dV)
pub type AttentionGrads<F> = (Array3<F>, Array3<F>, Array3<F>);

/// 注意力前向缓存
#[derive(Debug, Clone)]
pub struct AttentionCache<F> {
    q: Array3<F>,
    k: Array3<F>,
    v: Array3<F>,
    /// softmax 之后的注意力权重: [batch, seq_q, seq_k]
    weights: Array3<F>,
}

impl<F> AttentionCache<F> {
    pub fn attention_weights(&self) -> &Array3<F> {
        &self.weights
    }

    /// 检查 grad_output 是否为 [batch, seq_q, d_v]
    fn check_grad_output<S: Data<Elem = F>>(&self, grad_output: &ArrayBase<S, Ix3>) -> Result<()> {
        let (batch, seq_q, _) = self.q.dim();
        let d_v = self.v.dim().2;

        if grad_output.dim() != (batch, seq_q, d_v) {
            return Err(AttentionError::shape(
                "attention backward",
                &[batch, seq_q, d_v],
                grad_output.shape(),
            ));
        }
        Ok(())
    }
}

/// 缩放点积注意力
///
/// 没有可学习参数，只保存最近一次 forward 的缓存。
#[derive(Debug, Clone)]
pub struct ScaledDotProductAttention<F = f32> {
    cache: Option<AttentionCache<F>>,
}

impl<F: Scalar> Default for ScaledDotProductAttention<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Scalar> ScaledDotProductAttention<F> {
    pub fn new() -> Self {
        Self { cache: None }
    }

    /// 最近一次 forward 的注意力权重（用于可视化）
    pub fn attention_weights(&self) -> Option<&Array3<F>> {
        self.cache.as_ref().map(AttentionCache::attention_weights)
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `q`: Query [batch, seq_q, d_k]
    /// - `k`: Key [batch, seq_k, d_k]
    /// - `v`: Value [batch, seq_k, d_v]
    ///
    /// # 返回
    /// - 注意力输出 [batch, seq_q, d_v]
    pub fn forward(&mut self, q: &Array3<F>, k: &Array3<F>, v: &Array3<F>) -> Result<Array3<F>> {
        let (output, cache) = self.forward_cached(q.clone(), k.clone(), v.clone())?;
        self.cache = Some(cache);
        Ok(output)
    }

    /// 前向传播，缓存以返回值的形式交给调用方
    pub fn forward_cached(&self, q: Array3<F>, k: Array3<F>, v: Array3<F>) -> Result<(Array3<F>, AttentionCache<F>)> {
        let (batch, seq_q, d_k) = q.dim();
        let (k_batch, seq_k, k_dim) = k.dim();
        let (v_batch, seq_v, d_v) = v.dim();

        if d_k == 0 {
            return Err(AttentionError::InvalidDimension("d_k 不能为 0".to_string()));
        }
        if k_batch != batch || k_dim != d_k {
            return Err(AttentionError::shape("attention key", &[batch, seq_k, d_k], k.shape()));
        }
        if v_batch != batch || seq_v != seq_k {
            return Err(AttentionError::shape("attention value", &[batch, seq_k, d_v], v.shape()));
        }

        let scale = dim_as::<F>(d_k).sqrt();

        // 注意力分数: QKᵀ / √d_k
        let scores = q.bmm(&k.transpose_last())?.mapv(|s| s / scale);
        let weights = scores.softmax_last();
        let output = weights.bmm(&v)?;

        trace!(batch, seq_q, seq_k, d_k, d_v, "attention forward");

        Ok((output, AttentionCache { q, k, v, weights }))
    }

    /// 反向传播
    ///
    /// 输入: grad_output [batch, seq_q, d_v]
    /// 返回: (dQ, dK, dV)
    ///
    /// 形状检查失败时缓存保留。
    pub fn backward(&mut self, grad_output: &Array3<F>) -> Result<AttentionGrads<F>> {
        let cache = self
            .cache
            .take()
            .ok_or(AttentionError::MissingCache("ScaledDotProductAttention"))?;
        if let Err(err) = cache.check_grad_output(grad_output) {
            self.cache = Some(cache);
            return Err(err);
        }
        self.backward_cached(cache, grad_output)
    }

    /// 使用显式缓存的反向传播
    ///
    /// ```text
    /// dA = dY Vᵀ            dV = Aᵀ dY
    /// dS = A ⊙ (dA − rowsum(A ⊙ dA))
    /// dQ = dS K / √d_k      dK = dSᵀ Q / √d_k
    /// ```
    pub fn backward_cached<S: Data<Elem = F>>(
        &self,
        cache: AttentionCache<F>,
        grad_output: &ArrayBase<S, Ix3>,
    ) -> Result<AttentionGrads<F>> {
        cache.check_grad_output(grad_output)?;

        let AttentionCache { q, k, v, weights } = cache;
        let d_k = q.dim().2;
        let scale = dim_as::<F>(d_k).sqrt();

        // y = A V
        let grad_weights = grad_output.bmm(&v.transpose_last())?;
        let grad_v = weights.transpose_last().bmm(grad_output)?;

        // softmax 的雅可比向量积，不显式构造 diag(A) − AAᵀ
        let row_dot = (&weights * &grad_weights).sum_last_keepdims();
        let grad_scores = &weights * &(&grad_weights - &row_dot);

        // S = QKᵀ / √d_k
        let grad_q = grad_scores.bmm(&k)?.mapv(|g| g / scale);
        let grad_k = grad_scores.transpose_last().bmm(&q)?.mapv(|g| g / scale);

        Ok((grad_q, grad_k, grad_v))
    }
}

/// 自注意力前向缓存
#[derive(Debug, Clone)]
pub struct SelfAttentionCache<F> {
    input: Array3<F>,
    query: LinearCache<F>,
    key: LinearCache<F>,
    value: LinearCache<F>,
    attention: AttentionCache<F>,
}

impl<F> SelfAttentionCache<F> {
    pub fn input(&self) -> &Array3<F> {
        &self.input
    }

    pub fn attention_weights(&self) -> &Array3<F> {
        self.attention.attention_weights()
    }
}

/// 单头自注意力
///
/// ```text
/// x → [Wq, Wk, Wv] → Scaled Dot-Product Attention → out
/// ```
///
/// Q、K、V 共享同一个输入，反向时三路输入梯度相加。
#[derive(Debug, Clone)]
pub struct SelfAttention<F = f32> {
    /// Query 投影: [hidden_size, d_k]
    wq: Linear<F>,
    /// Key 投影: [hidden_size, d_k]
    wk: Linear<F>,
    /// Value 投影: [hidden_size, d_k]
    wv: Linear<F>,
    attn: ScaledDotProductAttention<F>,
    cache: Option<SelfAttentionCache<F>>,
}

impl<F: Scalar> SelfAttention<F> {
    /// 创建自注意力层
    ///
    /// 依次从 `rng` 初始化 Wq、Wk、Wv。
    pub fn new<R: Rng>(hidden_size: usize, d_k: usize, rng: &mut R) -> Result<Self> {
        let wq = Linear::new(hidden_size, d_k, rng)?;
        let wk = Linear::new(hidden_size, d_k, rng)?;
        let wv = Linear::new(hidden_size, d_k, rng)?;
        Self::from_projections(wq, wk, wv)
    }

    /// 用现成的三个投影层组装
    pub fn from_projections(wq: Linear<F>, wk: Linear<F>, wv: Linear<F>) -> Result<Self> {
        let expected = [wq.in_features(), wq.out_features()];
        for (name, layer) in [("key", &wk), ("value", &wv)] {
            let actual = [layer.in_features(), layer.out_features()];
            if actual != expected {
                return Err(AttentionError::ShapeMismatch {
                    op: "SelfAttention::from_projections",
                    expected: format!("{:?}", expected),
                    actual: format!("{} {:?}", name, actual),
                });
            }
        }

        Ok(Self {
            wq,
            wk,
            wv,
            attn: ScaledDotProductAttention::new(),
            cache: None,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.wq.in_features()
    }

    pub fn d_k(&self) -> usize {
        self.wq.out_features()
    }

    /// (Wq, Wk, Wv)
    pub fn projections(&self) -> (&Linear<F>, &Linear<F>, &Linear<F>) {
        (&self.wq, &self.wk, &self.wv)
    }

    pub fn param_count(&self) -> usize {
        self.wq.param_count() + self.wk.param_count() + self.wv.param_count()
    }

    /// 最近一次 forward 的注意力权重
    pub fn attention_weights(&self) -> Option<&Array3<F>> {
        self.cache.as_ref().map(SelfAttentionCache::attention_weights)
    }

    /// 前向传播
    ///
    /// 输入: [batch, seq_len, hidden_size]
    /// 输出: [batch, seq_len, d_k]
    pub fn forward<S: Data<Elem = F>>(&mut self, x: &ArrayBase<S, Ix3>) -> Result<Array3<F>> {
        let (output, cache) = self.forward_cached(x)?;
        self.cache = Some(cache);
        Ok(output)
    }

    /// 前向传播，缓存以返回值的形式交给调用方
    pub fn forward_cached<S: Data<Elem = F>>(
        &self,
        x: &ArrayBase<S, Ix3>,
    ) -> Result<(Array3<F>, SelfAttentionCache<F>)> {
        let (q, query) = self.wq.forward_cached(x)?;
        let (k, key) = self.wk.forward_cached(x)?;
        let (v, value) = self.wv.forward_cached(x)?;

        let (output, attention) = self.attn.forward_cached(q, k, v)?;

        let cache = SelfAttentionCache {
            input: x.to_owned(),
            query,
            key,
            value,
            attention,
        };

        Ok((output, cache))
    }

    /// 反向传播并用 SGD 更新三个投影层
    ///
    /// 输入: grad_output [batch, seq_len, d_k]
    /// 返回: grad_input [batch, seq_len, hidden_size]
    pub fn backward<S: Data<Elem = F>>(&mut self, grad_output: &ArrayBase<S, Ix3>, lr: F) -> Result<Array3<F>> {
        let cache = self.cache.take().ok_or(AttentionError::MissingCache("SelfAttention"))?;
        // dy 通过检查后，三个投影层的梯度形状也一定匹配，不会更新到一半失败
        if let Err(err) = cache.attention.check_grad_output(grad_output) {
            self.cache = Some(cache);
            return Err(err);
        }
        self.backward_cached(cache, grad_output, &mut Sgd::new(lr))
    }

    /// 使用显式缓存和优化器的反向传播
    pub fn backward_cached<S, O>(
        &mut self,
        cache: SelfAttentionCache<F>,
        grad_output: &ArrayBase<S, Ix3>,
        optimizer: &mut O,
    ) -> Result<Array3<F>>
    where
        S: Data<Elem = F>,
        O: Optimizer<F>,
    {
        let SelfAttentionCache {
            input,
            query,
            key,
            value,
            attention,
        } = cache;

        let (grad_q, grad_k, grad_v) = self.attn.backward_cached(attention, grad_output)?;

        let grad_input_q = self.wq.backward_cached(query, &grad_q, &mut *optimizer)?;
        let grad_input_k = self.wk.backward_cached(key, &grad_k, &mut *optimizer)?;
        let grad_input_v = self.wv.backward_cached(value, &grad_v, &mut *optimizer)?;

        let (batch, seq_len, hidden_size) = input.dim();
        debug!(batch, seq_len, hidden_size, d_k = self.d_k(), "self-attention backward");

        // 三个投影共享输入 x，梯度相加
        Ok(grad_input_q + &grad_input_k + &grad_input_v)
    }
}
