//! 用中心差分检查手写反向传播的梯度。
//!
//! 损失取 L = Σ y ⊙ G（G 固定），因此 ∂L/∂y = G。

use mini_attention::{
    Embedding, Linear, Optimizer, Result, ScaledDotProductAttention, SelfAttention, Sgd,
};
use ndarray::{arr2, Array, Array2, Array3, ArrayD, Dimension, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;

const EPSILON: f64 = 1e-6;
const TOLERANCE: f64 = 1e-4;
const ABS_FLOOR: f64 = 1e-7;

/// 逐元素比较解析梯度和数值梯度
fn assert_grads_are_close(name: &str, analytic: &[f64], numeric: &[f64]) {
    assert_eq!(analytic.len(), numeric.len(), "{}: 梯度长度不一致", name);

    for (i, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
        let diff = (a - n).abs();
        let larger = a.abs().max(n.abs());
        assert!(
            diff <= ABS_FLOOR + TOLERANCE * larger,
            "{}[{}]: analytic {:.9}, numeric {:.9}, relative error {:.3e}",
            name,
            i,
            a,
            n,
            diff / larger
        );
    }
}

/// 对 `x` 的每个元素做中心差分
fn numeric_grad<D, L>(x: &Array<f64, D>, mut loss: L) -> Vec<f64>
where
    D: Dimension,
    L: FnMut(&Array<f64, D>) -> f64,
{
    let mut grad = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        let mut plus = x.to_owned();
        plus.as_slice_mut().unwrap()[i] += EPSILON;
        let mut minus = x.to_owned();
        minus.as_slice_mut().unwrap()[i] -= EPSILON;
        grad.push((loss(&plus) - loss(&minus)) / (2.0 * EPSILON));
    }
    grad
}

fn weighted_sum<D: Dimension>(y: &Array<f64, D>, g: &Array<f64, D>) -> f64 {
    y.iter().zip(g.iter()).map(|(a, b)| a * b).sum()
}

fn flat<D: Dimension>(x: &Array<f64, D>) -> Vec<f64> {
    x.iter().copied().collect()
}

fn sample3(shape: (usize, usize, usize), seed: f64) -> Array3<f64> {
    Array3::from_shape_fn(shape, |(b, s, d)| ((b * 17 + s * 5 + d) as f64 * 0.61 + seed).sin())
}

/// 记录梯度但不修改参数的优化器
#[derive(Default)]
struct GradRecorder {
    grads: Vec<(String, Array2<f64>)>,
}

impl Optimizer<f64> for GradRecorder {
    fn step(&mut self, _param: &mut Array2<f64>, grad: &Array2<f64>, param_name: &str) -> Result<()> {
        self.grads.push((param_name.to_string(), grad.clone()));
        Ok(())
    }

    fn lr(&self) -> f64 {
        0.0
    }

    fn name(&self) -> &str {
        "recorder"
    }
}

fn check_linear(x: ArrayD<f64>) {
    let mut rng = StdRng::seed_from_u64(21);
    let layer: Linear<f64> = Linear::new(3, 4, &mut rng).unwrap();

    let mut out_shape = x.shape().to_vec();
    *out_shape.last_mut().unwrap() = 4;
    let g = ArrayD::from_shape_fn(IxDyn(&out_shape), |idx| (idx.slice().iter().sum::<usize>() as f64 * 0.7).cos());

    let (_, cache) = layer.forward_cached(&x).unwrap();
    let grads = layer.gradients(&cache, &g).unwrap();

    let numeric_x = numeric_grad(&x, |x| weighted_sum(&layer.forward_cached(x).unwrap().0, &g));
    assert_grads_are_close("linear dx", &flat(&grads.input), &numeric_x);

    let bias = layer.bias().clone();
    let numeric_w = numeric_grad(layer.weight(), |w| {
        let perturbed = Linear::from_parts(w.clone(), bias.clone()).unwrap();
        weighted_sum(&perturbed.forward_cached(&x).unwrap().0, &g)
    });
    assert_grads_are_close("linear dW", &flat(&grads.weight), &numeric_w);

    let weight = layer.weight().clone();
    let numeric_b = numeric_grad(&bias, |b| {
        let perturbed = Linear::from_parts(weight.clone(), b.clone()).unwrap();
        weighted_sum(&perturbed.forward_cached(&x).unwrap().0, &g)
    });
    assert_grads_are_close("linear db", &flat(&grads.bias), &numeric_b);
}

#[test]
fn linear_gradients_2d() {
    let x = arr2(&[[0.5, -1.0, 2.0], [1.5, 0.25, -0.75]]).into_dyn();
    check_linear(x);
}

#[test]
fn linear_gradients_3d() {
    check_linear(sample3((2, 3, 3), 0.2).into_dyn());
}

#[test]
fn embedding_gradients() {
    let mut rng = StdRng::seed_from_u64(5);
    let embedding: Embedding<f64> = Embedding::new(7, 3, &mut rng).unwrap();

    // 含重复索引和 PAD(0)
    let indices = arr2(&[[2, 2, 5, 0], [6, 2, 0, 0]]);
    let g = sample3((2, 4, 3), 1.1);

    let (_, cache) = embedding.forward_cached(&indices).unwrap();
    let analytic = embedding.gradients(&cache, &g).unwrap();

    let numeric = numeric_grad(embedding.weights(), |w| {
        let perturbed = Embedding::from_weights(w.clone()).unwrap();
        weighted_sum(&perturbed.forward_cached(&indices).unwrap().0, &g)
    });
    assert_grads_are_close("embedding dW", &flat(&analytic), &numeric);
}

#[test]
fn scaled_dot_product_gradients() {
    let attn = ScaledDotProductAttention::<f64>::new();
    let q = sample3((2, 3, 4), 0.0);
    let k = sample3((2, 3, 4), 0.8);
    let v = sample3((2, 3, 4), 1.9);
    let g = sample3((2, 3, 4), 2.7);

    let (_, cache) = attn.forward_cached(q.clone(), k.clone(), v.clone()).unwrap();
    let (dq, dk, dv) = attn.backward_cached(cache, &g).unwrap();

    let numeric_q = numeric_grad(&q, |q| {
        weighted_sum(&attn.forward_cached(q.clone(), k.clone(), v.clone()).unwrap().0, &g)
    });
    assert_grads_are_close("attention dQ", &flat(&dq), &numeric_q);

    let numeric_k = numeric_grad(&k, |k| {
        weighted_sum(&attn.forward_cached(q.clone(), k.clone(), v.clone()).unwrap().0, &g)
    });
    assert_grads_are_close("attention dK", &flat(&dk), &numeric_k);

    let numeric_v = numeric_grad(&v, |v| {
        weighted_sum(&attn.forward_cached(q.clone(), k.clone(), v.clone()).unwrap().0, &g)
    });
    assert_grads_are_close("attention dV", &flat(&dv), &numeric_v);
}

#[test]
fn scaled_dot_product_gradients_cross_length() {
    let attn = ScaledDotProductAttention::<f64>::new();
    let q = sample3((1, 2, 3), 0.4);
    let k = sample3((1, 4, 3), 1.3);
    let v = sample3((1, 4, 2), 2.2);
    let g = sample3((1, 2, 2), 3.1);

    let (_, cache) = attn.forward_cached(q.clone(), k.clone(), v.clone()).unwrap();
    let (dq, dk, _) = attn.backward_cached(cache, &g).unwrap();

    let numeric_q = numeric_grad(&q, |q| {
        weighted_sum(&attn.forward_cached(q.clone(), k.clone(), v.clone()).unwrap().0, &g)
    });
    assert_grads_are_close("attention dQ", &flat(&dq), &numeric_q);

    let numeric_k = numeric_grad(&k, |k| {
        weighted_sum(&attn.forward_cached(q.clone(), k.clone(), v.clone()).unwrap().0, &g)
    });
    assert_grads_are_close("attention dK", &flat(&dk), &numeric_k);
}

#[test]
fn self_attention_input_gradient() {
    let mut rng = StdRng::seed_from_u64(99);
    let sa: SelfAttention<f64> = SelfAttention::new(4, 2, &mut rng).unwrap();
    let x = sample3((1, 3, 4), 0.5);
    let g = sample3((1, 3, 2), 1.5);

    // lr = 0 时 backward 不改变参数
    let (_, cache) = sa.forward_cached(&x).unwrap();
    let dx = sa.clone().backward_cached(cache, &g, &mut Sgd::new(0.0)).unwrap();

    let numeric = numeric_grad(&x, |x| weighted_sum(&sa.forward_cached(x).unwrap().0, &g));
    assert_grads_are_close("self-attention dx", &flat(&dx), &numeric);
}

#[test]
fn self_attention_projection_gradients() {
    let mut rng = StdRng::seed_from_u64(7);
    let sa: SelfAttention<f64> = SelfAttention::new(3, 2, &mut rng).unwrap();
    let x = sample3((2, 3, 3), 0.9);
    let g = sample3((2, 3, 2), 0.1);

    let (_, cache) = sa.forward_cached(&x).unwrap();
    let mut recorder = GradRecorder::default();
    sa.clone().backward_cached(cache, &g, &mut recorder).unwrap();

    // 顺序: Wq.weight, Wq.bias, Wk.weight, Wk.bias, Wv.weight, Wv.bias
    assert_eq!(recorder.grads.len(), 6);
    assert!(recorder.grads.iter().step_by(2).all(|(name, _)| name == "linear.weight"));

    let (wq, wk, wv) = sa.projections();
    let (wq, wk, wv) = (wq.clone(), wk.clone(), wv.clone());

    let loss_with = |q: &Linear<f64>, k: &Linear<f64>, v: &Linear<f64>| {
        let perturbed = SelfAttention::from_projections(q.clone(), k.clone(), v.clone()).unwrap();
        weighted_sum(&perturbed.forward_cached(&x).unwrap().0, &g)
    };

    let numeric_q = numeric_grad(wq.weight(), |w| {
        loss_with(&Linear::from_parts(w.clone(), wq.bias().clone()).unwrap(), &wk, &wv)
    });
    assert_grads_are_close("Wq dW", &flat(&recorder.grads[0].1), &numeric_q);

    let numeric_k = numeric_grad(wk.weight(), |w| {
        loss_with(&wq, &Linear::from_parts(w.clone(), wk.bias().clone()).unwrap(), &wv)
    });
    assert_grads_are_close("Wk dW", &flat(&recorder.grads[2].1), &numeric_k);

    let numeric_v = numeric_grad(wv.weight(), |w| {
        loss_with(&wq, &wk, &Linear::from_parts(w.clone(), wv.bias().clone()).unwrap())
    });
    assert_grads_are_close("Wv dW", &flat(&recorder.grads[4].1), &numeric_v);

    let numeric_bv = numeric_grad(wv.bias(), |b| {
        loss_with(&wq, &wk, &Linear::from_parts(wv.weight().clone(), b.clone()).unwrap())
    });
    assert_grads_are_close("Wv db", &flat(&recorder.grads[5].1), &numeric_bv);
}
