//! 错误类型
//!
//! 所有错误都是调用方错误，立即返回，不做重试或恢复。

use thiserror::Error;

/// 模块运算中可能出现的错误
#[derive(Error, Debug)]
pub enum AttentionError {
    #[error("{op}: 形状不匹配，期望 {expected}，实际 {actual}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        actual: String,
    },

    #[error("索引 {index} 超出词表范围 [0, {vocab_size})")]
    IndexOutOfRange { index: usize, vocab_size: usize },

    #[error("{0}: backward 之前没有匹配的 forward 缓存")]
    MissingCache(&'static str),

    #[error("非法维度: {0}")]
    InvalidDimension(String),

    #[error("重塑失败: {0}")]
    Reshape(#[from] ndarray::ShapeError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl AttentionError {
    pub(crate) fn shape(op: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        AttentionError::ShapeMismatch {
            op,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
