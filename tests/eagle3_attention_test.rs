//! Integration tests for the TTT draft attention.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use eagle3_train::eagle3::{
    AttentionBackend, AttentionMask, Eagle3Attention, Eagle3DraftConfig, TttCache,
};

fn test_device() -> Device {
    Device::Cpu
}

fn tiny_config() -> Eagle3DraftConfig {
    serde_json::from_value(serde_json::json!({
        "vocab_size": 32,
        "draft_vocab_size": 8,
        "hidden_size": 16,
        "intermediate_size": 32,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "head_dim": 4,
        "max_position_embeddings": 64
    }))
    .unwrap()
}

/// Two attentions with the same weights, one per backend.
fn attention_pair(varmap: &VarMap, device: &Device) -> (Eagle3Attention, Eagle3Attention) {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let config = tiny_config();
    let sdpa = Eagle3Attention::new(&config, AttentionBackend::Sdpa, vb.pp("attn")).unwrap();
    let flex =
        Eagle3Attention::new(&config, AttentionBackend::FlexAttention, vb.pp("attn")).unwrap();
    (sdpa, flex)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap()
}

#[test]
fn test_backends_agree_over_ttt_steps() {
    let device = test_device();
    let varmap = VarMap::new();
    let (sdpa, flex) = attention_pair(&varmap, &device);

    let attention_mask = Tensor::new(&[[1u8, 1, 1, 1, 1], [1, 1, 1, 0, 0]], &device).unwrap();
    let mask = AttentionMask::from_attention_mask(&attention_mask).unwrap();

    let mut sdpa_cache = TttCache::new();
    let mut flex_cache = TttCache::new();
    for step in 0..4 {
        let x = Tensor::randn(0.0f32, 1.0, (2, 5, 32), &device).unwrap();
        let a = sdpa.forward(&x, &mask, Some(&mut sdpa_cache)).unwrap();
        let b = flex.forward(&x, &mask, Some(&mut flex_cache)).unwrap();
        assert_eq!(a.dims(), &[2, 5, 16]);
        assert!(max_abs_diff(&a, &b) < 1e-4, "backends diverge at step {step}");
    }
    assert_eq!(sdpa_cache.len(), 4);
    assert_eq!(flex_cache.len(), 4);
}

#[test]
fn test_first_step_matches_plain_causal_attention() {
    let device = test_device();
    let varmap = VarMap::new();
    let (sdpa, _) = attention_pair(&varmap, &device);
    let mask = AttentionMask::full(1, 6, &device).unwrap();
    let x = Tensor::randn(0.0f32, 1.0, (1, 6, 32), &device).unwrap();

    let mut cache = TttCache::new();
    let cached = sdpa.forward(&x, &mask, Some(&mut cache)).unwrap();
    let plain = sdpa.forward(&x, &mask, None).unwrap();
    assert!(max_abs_diff(&cached, &plain) < 1e-5);
}

#[test]
fn test_later_steps_only_see_own_position() {
    let device = test_device();
    let varmap = VarMap::new();
    let (_, flex) = attention_pair(&varmap, &device);
    let mask = AttentionMask::full(1, 4, &device).unwrap();

    let x0 = Tensor::randn(0.0f32, 1.0, (1, 4, 32), &device).unwrap();
    let x1 = Tensor::randn(0.0f32, 1.0, (1, 4, 32), &device).unwrap();
    // Same as x1 except at the last position.
    let noise = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &device).unwrap();
    let x1_changed = Tensor::cat(&[&x1.narrow(1, 0, 3).unwrap(), &noise], 1).unwrap();

    let run = |second: &Tensor| {
        let mut cache = TttCache::new();
        flex.forward(&x0, &mask, Some(&mut cache)).unwrap();
        flex.forward(second, &mask, Some(&mut cache)).unwrap()
    };
    let a = run(&x1);
    let b = run(&x1_changed);

    assert!(max_abs_diff(&a.narrow(1, 0, 3).unwrap(), &b.narrow(1, 0, 3).unwrap()) < 1e-5);
    assert!(max_abs_diff(&a.narrow(1, 3, 1).unwrap(), &b.narrow(1, 3, 1).unwrap()) > 1e-6);
}

#[test]
fn test_padded_row_matches_unpadded_prefix() {
    let device = test_device();
    let varmap = VarMap::new();
    let (sdpa, _) = attention_pair(&varmap, &device);

    let x = Tensor::randn(0.0f32, 1.0, (1, 5, 32), &device).unwrap();
    let padded_mask =
        AttentionMask::from_attention_mask(&Tensor::new(&[[1u8, 1, 1, 0, 0]], &device).unwrap())
            .unwrap();
    let short_mask = AttentionMask::full(1, 3, &device).unwrap();

    let padded = sdpa.forward(&x, &padded_mask, None).unwrap();
    let short = sdpa.forward(&x.narrow(1, 0, 3).unwrap(), &short_mask, None).unwrap();
    assert!(max_abs_diff(&padded.narrow(1, 0, 3).unwrap(), &short) < 1e-5);
}

#[test]
fn test_mask_length_mismatch_is_error() {
    let device = test_device();
    let varmap = VarMap::new();
    let (sdpa, _) = attention_pair(&varmap, &device);
    let mask = AttentionMask::full(1, 4, &device).unwrap();
    let x = Tensor::zeros((1, 5, 32), DType::F32, &device).unwrap();
    assert!(sdpa.forward(&x, &mask, None).is_err());
}
