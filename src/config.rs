//! 模块配置
//!
//! 保存构建 Embedding 和 SelfAttention 所需的维度、学习率与随机种子，
//! 支持 JSON 读写。

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::attention::SelfAttention;
use crate::embedding::Embedding;
use crate::error::{AttentionError, Result};
use crate::tensor::Scalar;

/// 模块配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// 词表大小（分词器输出的 token ID 都小于它）
    pub vocab_size: usize,
    /// 嵌入维度，也是自注意力的输入维度
    pub hidden_size: usize,
    /// Q/K/V 投影维度
    pub d_k: usize,
    /// SGD 学习率
    pub learning_rate: f32,
    /// 参数初始化的随机种子
    pub seed: u64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            vocab_size: 512,
            hidden_size: 32,
            d_k: 16,
            learning_rate: 0.01,
            seed: 42,
        }
    }
}

impl AttentionConfig {
    /// 检查配置是否合法
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.d_k == 0 {
            return Err(AttentionError::InvalidDimension(format!(
                "vocab_size={}, hidden_size={}, d_k={}",
                self.vocab_size, self.hidden_size, self.d_k
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate >= 0.0) {
            return Err(AttentionError::InvalidDimension(format!(
                "learning_rate={}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// 按种子创建随机数生成器
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// 学习率转换为模块的元素类型
    pub fn lr<F: Scalar>(&self) -> F {
        num_traits::cast(self.learning_rate).unwrap_or_else(F::zero)
    }

    /// 构建嵌入层: [vocab_size, hidden_size]
    pub fn build_embedding<F: Scalar>(&self, rng: &mut StdRng) -> Result<Embedding<F>> {
        self.validate()?;
        Embedding::new(self.vocab_size, self.hidden_size, rng)
    }

    /// 构建自注意力层: hidden_size → d_k
    pub fn build_self_attention<F: Scalar>(&self, rng: &mut StdRng) -> Result<SelfAttention<F>> {
        self.validate()?;
        SelfAttention::new(self.hidden_size, self.d_k, rng)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 从 JSON 文件加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// 保存为 JSON 文件
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
