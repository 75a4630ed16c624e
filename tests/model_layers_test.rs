//! Integration tests for the Qwen3 building blocks.

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use eagle3_train::model::{
    MASK_VALUE, Qwen3Attention, Qwen3Config, Qwen3DecoderLayer, RmsNorm, RotaryEmbedding,
    causal_mask, repeat_kv,
};

fn test_device() -> Device {
    Device::Cpu
}

fn tiny_config() -> Qwen3Config {
    serde_json::from_value(serde_json::json!({
        "vocab_size": 32,
        "hidden_size": 16,
        "intermediate_size": 32,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "head_dim": 4,
        "max_position_embeddings": 64
    }))
    .unwrap()
}

fn tiny_rope(config: &Qwen3Config, device: &Device) -> RotaryEmbedding {
    RotaryEmbedding::new(
        config.head_dim,
        config.max_position_embeddings,
        config.rope_theta,
        DType::F32,
        device,
    )
    .unwrap()
}

#[test]
fn test_rmsnorm_unit_rms() {
    let device = test_device();
    let norm = RmsNorm::new_ones(64, 1e-6, DType::F32, &device).unwrap();
    let x = (Tensor::randn(0.0f32, 1.0, (2, 4, 64), &device).unwrap() * 7.0).unwrap();

    let y = norm.forward(&x).unwrap();
    let rms = y.sqr().unwrap().mean(D::Minus1).unwrap().sqrt().unwrap();
    for v in rms.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
        assert!((v - 1.0).abs() < 1e-3);
    }
}

#[test]
fn test_causal_mask_layout() {
    let mask = causal_mask(3, &test_device()).unwrap();
    let m = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(m[0], vec![0.0, MASK_VALUE, MASK_VALUE]);
    assert_eq!(m[2], vec![0.0, 0.0, 0.0]);
}

#[test]
fn test_repeat_kv_expands_heads() {
    let device = test_device();
    let x = Tensor::arange(0f32, 8.0, &device)
        .unwrap()
        .reshape((1, 2, 2, 2))
        .unwrap();
    let y = repeat_kv(&x, 3).unwrap();
    assert_eq!(y.dims(), &[1, 6, 2, 2]);

    // Heads 0..3 copy KV head 0, heads 3..6 copy KV head 1.
    let head = |t: &Tensor, h: usize| t.narrow(1, h, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(head(&y, 2), head(&x, 0));
    assert_eq!(head(&y, 3), head(&x, 1));
}

#[test]
fn test_attention_is_causal() {
    let device = test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let config = tiny_config();
    let attn = Qwen3Attention::new(&config, &tiny_rope(&config, &device), vb).unwrap();
    assert_eq!(attn.num_heads(), 4);
    assert_eq!(attn.num_kv_heads(), 2);
    assert_eq!(attn.head_dim(), 4);

    let x = Tensor::randn(0.0f32, 1.0, (1, 5, 16), &device).unwrap();
    let tail = Tensor::randn(0.0f32, 1.0, (1, 2, 16), &device).unwrap();
    let y = Tensor::cat(&[&x.narrow(1, 0, 3).unwrap(), &tail], 1).unwrap();

    let mask = causal_mask(5, &device).unwrap();
    let ox = attn.forward(&x, &mask).unwrap();
    let oy = attn.forward(&y, &mask).unwrap();
    assert_eq!(ox.dims(), &[1, 5, 16]);

    let diff: f32 = (ox.narrow(1, 0, 3).unwrap() - oy.narrow(1, 0, 3).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(diff < 1e-5);
}

#[test]
fn test_decoder_layer_preserves_shape() {
    let device = test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let config = tiny_config();
    let layer =
        Qwen3DecoderLayer::new(&config, &tiny_rope(&config, &device), vb.pp("layer")).unwrap();

    let x = Tensor::randn(0.0f32, 1.0, (2, 4, 16), &device).unwrap();
    let out = layer.forward(&x, &causal_mask(4, &device).unwrap()).unwrap();
    assert_eq!(out.dims(), &[2, 4, 16]);
    assert_eq!(layer.self_attn().head_dim(), 4);
}

#[test]
fn test_attention_rejects_mismatched_rope() {
    let device = test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let rope = RotaryEmbedding::new(8, 64, 10000.0, DType::F32, &device).unwrap();
    assert!(Qwen3Attention::new(&tiny_config(), &rope, vb).is_err());
}
