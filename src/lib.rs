//! # Mini Attention
//!
//! 从零实现的 Transformer 基础模块，每个模块都带有手工推导的反向传播和
//! 原地 SGD 更新，不依赖自动求导。
//!
//! ## 模块概览
//!
//! ```text
//! token IDs → Embedding → SelfAttention → out
//!                          ├── Linear (Wq, Wk, Wv)
//!                          └── ScaledDotProductAttention
//! ```
//!
//! 每个模块都是 `forward` 之后接一次 `backward(grad_output, lr)`。
//! 需要同时保留多组中间结果时，用 `forward_cached` / `backward_cached`
//! 显式传递缓存。

pub mod tensor;
pub mod error;
pub mod optimizer;
pub mod linear;
pub mod embedding;
pub mod attention;
pub mod config;

pub use tensor::{Scalar, TensorExt};
pub use error::{AttentionError, Result};
pub use optimizer::{Optimizer, Sgd};
pub use linear::{Linear, LinearCache, LinearGrads};
pub use embedding::{pad_batch, Embedding, EmbeddingCache, PAD_INDEX};
pub use attention::{
    AttentionCache, AttentionGrads, ScaledDotProductAttention, SelfAttention, SelfAttentionCache,
};
pub use config::AttentionConfig;

/// 预设配置
pub mod configs {
    use super::AttentionConfig;

    /// 极小配置（用于快速测试）
    ///
    /// 词表对应字节级 BPE：256 个字节加少量合并。
    pub fn tiny() -> AttentionConfig {
        AttentionConfig {
            vocab_size: 260,
            hidden_size: 8,
            d_k: 4,
            learning_rate: 0.05,
            seed: 42,
        }
    }

    /// 小型配置
    pub fn small() -> AttentionConfig {
        AttentionConfig {
            vocab_size: 1024,
            hidden_size: 64,
            d_k: 32,
            learning_rate: 0.01,
            seed: 42,
        }
    }
}
