use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use slotscan::cache::Cache;
use slotscan::config::GsaConfig;
use slotscan::layers::{FeatureMapKind, GatedSlotAttention};
use slotscan::numeric::{max_rel_diff, uniform};
use slotscan::Error;

fn random(seed: u64, shape: &[usize]) -> Tensor {
    uniform(&mut StdRng::seed_from_u64(seed), shape, -1.0, 1.0, &Device::Cpu).unwrap()
}

fn small_config() -> GsaConfig {
    let mut cfg = GsaConfig::new(16, 4);
    cfg.num_kv_heads = Some(2);
    cfg.num_slots = Some(4);
    cfg.use_short_conv = true;
    cfg.conv_bias = true;
    cfg
}

fn build(cfg: &GsaConfig) -> (GatedSlotAttention, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let layer = GatedSlotAttention::new(cfg, Some(0), vb).unwrap();
    (layer, varmap)
}

fn assert_close(name: &str, a: &Tensor, b: &Tensor, tol: f64) {
    let err = max_rel_diff(a, b).unwrap();
    assert!(err < tol, "{name}: max relative diff {err}");
}

fn row(t: &Tensor, i: usize) -> Tensor {
    t.narrow(0, i, 1).unwrap()
}

#[test]
fn test_all_ones_mask_matches_no_mask() {
    let (layer, _vm) = build(&small_config());
    let x = random(1, &[2, 6, 16]);
    let mask = Tensor::ones((2, 6), DType::F32, &Device::Cpu).unwrap();
    let masked = layer.forward(&x, Some(&mask), None, false).unwrap();
    let plain = layer.forward(&x, None, None, false).unwrap();
    assert_close("o", &masked, &plain, 1e-5);
}

#[test]
fn test_left_padding_matches_unpadded_suffix() {
    let (layer, _vm) = build(&small_config());
    let x = random(2, &[2, 7, 16]);
    // Row 0 is padded by three tokens, row 1 is full
    let mask = Tensor::new(&[[0f32, 0., 0., 1., 1., 1., 1.], [1., 1., 1., 1., 1., 1., 1.]], &Device::Cpu).unwrap();
    let out = layer.forward(&x, Some(&mask), None, false).unwrap();

    let pad = out.narrow(0, 0, 1).unwrap().narrow(1, 0, 3).unwrap();
    assert_eq!(pad.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

    let suffix = layer
        .forward(&x.narrow(0, 0, 1).unwrap().narrow(1, 3, 4).unwrap(), None, None, false)
        .unwrap();
    assert_close("row0", &out.narrow(0, 0, 1).unwrap().narrow(1, 3, 4).unwrap(), &suffix, 1e-5);

    let full = layer.forward(&x.narrow(0, 1, 1).unwrap(), None, None, false).unwrap();
    assert_close("row1", &out.narrow(0, 1, 1).unwrap(), &full, 1e-5);
}

#[test]
fn test_left_padding_leaves_cached_state_of_suffix() {
    let (layer, _vm) = build(&small_config());
    let x = random(8, &[2, 7, 16]);
    let mask = Tensor::new(&[[0f32, 0., 0., 1., 1., 1., 1.], [1., 1., 1., 1., 1., 1., 1.]], &Device::Cpu).unwrap();
    let mut padded = Cache::new();
    layer.forward(&x, Some(&mask), Some(&mut padded), true).unwrap();

    let suffix_x = row(&x, 0).narrow(1, 3, 4).unwrap();
    let mut suffix = Cache::new();
    layer.forward(&suffix_x, None, Some(&mut suffix), true).unwrap();

    let (p, s) = (padded.get(0).unwrap(), suffix.get(0).unwrap());
    let (ps, ss) = (p.recurrent_state.as_ref().unwrap(), s.recurrent_state.as_ref().unwrap());
    assert_close("hk", &row(&ps.hk, 0), &ss.hk, 1e-5);
    assert_close("hv", &row(&ps.hv, 0), &ss.hv, 1e-5);
    let (pc, sc) = (p.conv_state.as_ref().unwrap(), s.conv_state.as_ref().unwrap());
    assert_close("conv.q", &row(&pc.q, 0), &sc.q, 1e-5);
    assert_close("conv.k", &row(&pc.k, 0), &sc.k, 1e-5);
    assert_close("conv.v", &row(&pc.v, 0), &sc.v, 1e-5);

    // One more token continues from those states
    let next = random(9, &[2, 1, 16]);
    let ones = Tensor::ones((2, 1), DType::F32, &Device::Cpu).unwrap();
    let a = layer.forward(&next, Some(&ones), Some(&mut padded), true).unwrap();
    let b = layer.forward(&row(&next, 0), None, Some(&mut suffix), true).unwrap();
    assert_close("decode", &row(&a, 0), &b, 1e-5);
}

#[test]
fn test_fully_padded_batch_returns_zeros() {
    let (layer, _vm) = build(&small_config());
    let x = random(10, &[2, 3, 16]);
    let mask = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
    let out = layer.forward(&x, Some(&mask), None, false).unwrap();
    assert_eq!(out.dims(), &[2, 3, 16]);
    assert_eq!(out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

    // A cached call skips the recurrence but still counts the tokens
    let mut cache = Cache::new();
    layer.forward(&random(11, &[2, 2, 16]), None, Some(&mut cache), true).unwrap();
    let before = cache.get(0).unwrap().clone();
    let out = layer.forward(&x, Some(&mask), Some(&mut cache), true).unwrap();
    assert_eq!(out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

    let after = cache.get(0).unwrap();
    assert_eq!(cache.seq_length(0), 5);
    let (b, a) = (before.recurrent_state.as_ref().unwrap(), after.recurrent_state.as_ref().unwrap());
    assert_close("hk", &a.hk, &b.hk, 1e-7);
    assert_close("hv", &a.hv, &b.hv, 1e-7);
    let (b, a) = (before.conv_state.as_ref().unwrap(), after.conv_state.as_ref().unwrap());
    assert_close("conv.q", &a.q, &b.q, 1e-7);
}

#[test]
fn test_mask_uses_last_columns() {
    let (layer, _vm) = build(&small_config());
    let x = random(3, &[1, 3, 16]);
    let long_mask = Tensor::new(&[[0f32, 0., 1., 1., 1.]], &Device::Cpu).unwrap();
    let a = layer.forward(&x, Some(&long_mask), None, false).unwrap();
    let b = layer.forward(&x, None, None, false).unwrap();
    assert_close("o", &a, &b, 1e-5);
}

#[test]
fn test_packed_matches_per_sequence() {
    let (layer, _vm) = build(&small_config());
    let x = random(4, &[1, 9, 16]);
    let cu = [0usize, 4, 9];
    let packed = layer.forward_packed(&x, &cu, None, false).unwrap();
    for w in cu.windows(2) {
        let xs = x.narrow(1, w[0], w[1] - w[0]).unwrap();
        let ys = layer.forward(&xs, None, None, false).unwrap();
        assert_close("o", &packed.narrow(1, w[0], w[1] - w[0]).unwrap(), &ys, 1e-5);
    }
}

#[test]
fn test_incremental_decoding_matches_full_forward() {
    for feature_map in [FeatureMapKind::Swish, FeatureMapKind::T2r] {
        let mut cfg = small_config();
        cfg.feature_map = feature_map;
        let (layer, _vm) = build(&cfg);
        let x = random(5, &[2, 8, 16]);
        let full = layer.forward(&x, None, None, false).unwrap();

        let mut cache = Cache::new();
        let mut steps = vec![layer.forward(&x.narrow(1, 0, 3).unwrap(), None, Some(&mut cache), true).unwrap()];
        for t in 3..8 {
            let xt = x.narrow(1, t, 1).unwrap();
            steps.push(layer.forward(&xt, None, Some(&mut cache), true).unwrap());
        }
        assert_eq!(cache.seq_length(0), 8);
        let stepped = Tensor::cat(&steps, 1).unwrap();
        assert_close("o", &stepped, &full, 1e-4);
    }
}

#[test]
fn test_cache_requires_layer_idx() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let layer = GatedSlotAttention::new(&small_config(), None, vb).unwrap();
    let mut cache = Cache::new();
    let res = layer.forward(&random(6, &[1, 2, 16]), None, Some(&mut cache), true);
    assert!(matches!(res, Err(Error::MissingLayerIndex)));
}

#[test]
fn test_three_dimensional_mask_rejected() {
    let (layer, _vm) = build(&small_config());
    let mask = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
    let res = layer.forward(&random(7, &[1, 2, 16]), Some(&mask), None, false);
    assert!(matches!(res, Err(Error::MaskRank(3))));
}
