//! Integration tests for the EAGLE3 draft model.

use candle_core::{DType, Device, Tensor};
use eagle3_train::eagle3::{
    AttentionBackend, AttentionMask, Eagle3DraftConfig, Eagle3DraftModel, TttCache, VocabMapping,
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
        "max_position_embeddings": 64,
        "target_hidden_size": 12
    }))
    .unwrap()
}

fn mapping() -> VocabMapping {
    let mut counts = vec![0u64; 32];
    for (i, id) in [3usize, 5, 8, 13, 21, 22, 30, 31].iter().enumerate() {
        counts[*id] = 10 + i as u64;
    }
    VocabMapping::from_counts(&counts, 8).unwrap()
}

fn new_model(backend: AttentionBackend) -> Eagle3DraftModel {
    Eagle3DraftModel::new(tiny_config(), backend, DType::F32, &test_device()).unwrap()
}

#[test]
fn test_forward_shapes() {
    let device = test_device();
    let model = new_model(AttentionBackend::Sdpa);
    let ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 0, 0]], &device).unwrap();
    let aux = Tensor::randn(0.0f32, 1.0, (2, 4, 36), &device).unwrap();
    let mask = AttentionMask::from_attention_mask(
        &Tensor::new(&[[1u8, 1, 1, 1], [1, 1, 0, 0]], &device).unwrap(),
    )
    .unwrap();

    let emb = model.embed_input_ids(&ids).unwrap();
    assert_eq!(emb.dims(), &[2, 4, 16]);

    let hidden = model.forward(&aux, &emb, &mask).unwrap();
    assert_eq!(hidden.dims(), &[2, 4, 16]);

    let projected = model.project_hidden_states(&aux).unwrap();
    let mut cache = TttCache::new();
    let h1 = model.backbone(&emb, &projected, &mask, Some(&mut cache)).unwrap();
    let h2 = model.backbone(&emb, &h1, &mask, Some(&mut cache)).unwrap();
    let logits = model.compute_logits(&h2).unwrap();
    assert_eq!(logits.dims(), &[2, 4, 8]);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_draft_to_target_uses_mapping() {
    let device = test_device();
    let mut model = new_model(AttentionBackend::FlexAttention);
    model.set_vocab_mapping(&mapping()).unwrap();

    let draft_ids = Tensor::new(&[[0u32, 1, 7], [2, 3, 4]], &device).unwrap();
    let target_ids = model.draft_to_target(&draft_ids).unwrap();
    assert_eq!(
        target_ids.to_vec2::<u32>().unwrap(),
        vec![vec![3, 5, 31], vec![8, 13, 21]]
    );
}

#[test]
fn test_vocab_mapping_size_mismatch_rejected() {
    let mut model = new_model(AttentionBackend::Sdpa);
    let wrong = VocabMapping::from_counts(&[1u64; 32], 4).unwrap();
    assert!(model.set_vocab_mapping(&wrong).is_err());
}

#[test]
fn test_save_and_load_restore_weights_and_mapping() {
    let device = test_device();
    let dir = tempfile::tempdir().unwrap();

    let mut saved = new_model(AttentionBackend::Sdpa);
    saved.set_vocab_mapping(&mapping()).unwrap();
    saved.save(dir.path()).unwrap();
    assert!(dir.path().join("model.safetensors").is_file());
    assert!(dir.path().join("config.json").is_file());

    let reloaded_config = Eagle3DraftConfig::from_file(&dir.path().join("config.json")).unwrap();
    assert_eq!(reloaded_config, tiny_config());
    assert_eq!(saved.config(), &reloaded_config);

    let mut loaded = new_model(AttentionBackend::Sdpa);
    loaded
        .load_weights(&dir.path().join("model.safetensors"))
        .unwrap();

    let ids = Tensor::new(&[[1u32, 2, 3]], &device).unwrap();
    let aux = Tensor::randn(0.0f32, 1.0, (1, 3, 36), &device).unwrap();
    let mask = AttentionMask::full(1, 3, &device).unwrap();
    let run = |m: &Eagle3DraftModel| {
        let emb = m.embed_input_ids(&ids).unwrap();
        m.compute_logits(&m.forward(&aux, &emb, &mask).unwrap()).unwrap()
    };
    let diff: f32 = (run(&saved) - run(&loaded))
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(diff < 1e-6);

    let restored = VocabMapping::from_tensors(loaded.t2d(), loaded.d2t()).unwrap();
    assert_eq!(restored, mapping());
}
