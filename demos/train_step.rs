//! 训练步骤示例
//!
//! 演示 Embedding → SelfAttention 的前向、反向与 SGD 更新。
//! 损失函数（MSE）由调用方自己负责。

use mini_attention::{configs, pad_batch, PAD_INDEX};
use ndarray::Array3;

fn main() -> mini_attention::Result<()> {
    println!("╔════════════════════════════════════════════════╗");
    println!("║     Self-Attention 训练步骤示例               ║");
    println!("╚════════════════════════════════════════════════╝\n");

    let config = configs::tiny();
    println!("配置:");
    println!("  - vocab_size: {}", config.vocab_size);
    println!("  - hidden_size: {}", config.hidden_size);
    println!("  - d_k: {}", config.d_k);
    println!("  - learning_rate: {}", config.learning_rate);

    let mut rng = config.rng();
    let mut embedding = config.build_embedding::<f32>(&mut rng)?;
    let mut attention = config.build_self_attention::<f32>(&mut rng)?;
    println!(
        "\n参数总数: {}",
        embedding.param_count() + attention.param_count()
    );

    // 分词器输出的 token 序列（字节级），补齐到相同长度
    let sequences: Vec<Vec<usize>> = ["hello", "attention", "rust"]
        .iter()
        .map(|text| text.bytes().map(usize::from).collect())
        .collect();
    let max_length = sequences.iter().map(Vec::len).max().unwrap_or(0);
    let tokens = pad_batch(&sequences, max_length, PAD_INDEX);
    println!("输入形状: {:?}", tokens.shape());

    let target = Array3::from_shape_fn((tokens.nrows(), max_length, config.d_k), |(b, s, d)| {
        ((b * 3 + s + d) as f32 * 0.25).sin() * 0.5
    });
    let lr = config.lr::<f32>();

    for step in 0..20 {
        let hidden = embedding.forward(&tokens)?;
        let output = attention.forward(&hidden)?;

        let n = output.len() as f32;
        let diff = &output - &target;
        let loss = 0.5 * diff.iter().map(|d| d * d).sum::<f32>() / n;

        let grad_hidden = attention.backward(&diff.mapv(|d| d / n), lr)?;
        embedding.backward(&grad_hidden, lr)?;

        if step % 5 == 0 {
            println!("step {:>2}: loss = {:.6}", step, loss);
        }
    }

    // backward 会消耗缓存，再做一次前向查看注意力权重
    let output = attention.forward(&embedding.forward(&tokens)?)?;
    println!("\n输出形状: {:?}", output.shape());
    if let Some(weights) = attention.attention_weights() {
        println!("注意力权重形状: {:?}", weights.shape());
    }

    println!("\n✓ 完成");
    Ok(())
}
