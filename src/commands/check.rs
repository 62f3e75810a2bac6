//! Check command implementation
//!
//! Runs the chunked and fused kernels on the same random problem and reports
//! the largest relative difference of every output, final state and gradient.
//! Also checks that incremental decoding through the layer cache matches a
//! full-sequence forward.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use slotscan::cache::Cache;
use slotscan::config::RunConfig;
use slotscan::layers::GatedSlotAttention;
use slotscan::numeric::{max_rel_diff, uniform};
use slotscan::ops::{
    chunk_gsa_fwd, chunk_iplr_delta_rule_fwd, fused_recurrent_gsa_fwd,
    fused_recurrent_iplr_delta_rule_fwd, DeltaRuleInputs, GsaInputs, KernelOptions,
};

/// Check command arguments
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the configuration YAML file
    #[arg(short = 'f', long = "config", default_value = "configs/small.yaml")]
    pub config_file: String,

    /// Override the layer mode: "chunk" or "fused_recurrent"
    #[arg(long)]
    pub mode: Option<String>,

    /// Override the layer precision for the decode check: "f32", "f16" or "bf16"
    #[arg(long)]
    pub dtype: Option<String>,

    /// Headless mode: output only JSON (no fancy UI)
    #[arg(long)]
    pub headless: bool,
}

type Diffs = Vec<(String, f64)>;

fn record(diffs: &mut Diffs, name: &str, a: &Tensor, b: &Tensor) -> Result<()> {
    let d = max_rel_diff(a, b).with_context(|| format!("comparing {}", name))?;
    diffs.push((name.to_string(), d));
    Ok(())
}

/// IPLR with a delta-rule parameterization `a = -beta * k̂`, `b = k̂`,
/// which keeps long random sequences bounded.
fn check_delta_rule(config: &RunConfig, rng: &mut StdRng, device: &Device, diffs: &mut Diffs) -> Result<()> {
    let cfg = &config.layer;
    let (b, t) = (config.problem.batch_size, config.problem.seq_len);
    let (h, k, v) = (cfg.num_heads, cfg.head_k_dim(), cfg.head_v_dim());

    let q = uniform(rng, &[b, t, h, k], -1.0, 1.0, device)?;
    let k_raw = uniform(rng, &[b, t, h, k], -1.0, 1.0, device)?;
    let k_hat = k_raw.broadcast_div(&k_raw.sqr()?.sum_keepdim(3)?.sqrt()?)?;
    let beta = uniform(rng, &[b, t, h, 1], 0.1, 0.9, device)?;
    let inputs = DeltaRuleInputs {
        q,
        k: k_hat.clone(),
        v: uniform(rng, &[b, t, h, v], -1.0, 1.0, device)?,
        a: k_hat.broadcast_mul(&beta)?.neg()?,
        b: k_hat,
    };
    let opts = KernelOptions::default()
        .with_final_state(true)
        .with_chunk_size(cfg.chunk_size)
        .with_block_v(cfg.block_v);

    let (o_f, ht_f, ctx_f) = fused_recurrent_iplr_delta_rule_fwd(&inputs, None, &opts)?;
    let (o_c, ht_c, ctx_c) = chunk_iplr_delta_rule_fwd(&inputs, None, &opts)?;
    record(diffs, "iplr.o", &o_f, &o_c)?;
    if let (Some(a), Some(b)) = (&ht_f, &ht_c) {
        record(diffs, "iplr.ht", a, b)?;
    }

    let d_o = uniform(rng, o_f.dims(), -1.0, 1.0, device)?;
    let g_f = ctx_f.backward(&d_o, None)?;
    let g_c = ctx_c.backward(&d_o, None)?;
    for (name, a, b) in [
        ("iplr.dq", &g_f.dq, &g_c.dq),
        ("iplr.dk", &g_f.dk, &g_c.dk),
        ("iplr.dv", &g_f.dv, &g_c.dv),
        ("iplr.da", &g_f.da, &g_c.da),
        ("iplr.db", &g_f.db, &g_c.db),
    ] {
        record(diffs, name, a, b)?;
    }
    Ok(())
}

fn check_gsa(config: &RunConfig, rng: &mut StdRng, device: &Device, diffs: &mut Diffs) -> Result<()> {
    let cfg = &config.layer;
    let (b, t) = (config.problem.batch_size, config.problem.seq_len);
    let (h, k, v, m) = (cfg.num_heads, cfg.head_k_dim(), cfg.head_v_dim(), cfg.slots());

    // Log-decays in (ln 0.9, ln 0.999) and the matching write strengths
    let g = uniform(rng, &[b, t, h, m], 0.9, 0.999, device)?.log()?;
    let s = g.exp()?.affine(-1.0, 1.0)?;
    let inputs = GsaInputs {
        q: uniform(rng, &[b, t, h, k], -1.0, 1.0, device)?,
        k: uniform(rng, &[b, t, h, k], -1.0, 1.0, device)?,
        v: uniform(rng, &[b, t, h, v], -1.0, 1.0, device)?,
        s,
        g,
    };
    let mut opts = KernelOptions::default()
        .with_final_state(true)
        .with_chunk_size(cfg.chunk_size)
        .with_block_v(cfg.block_v);
    opts.scale = cfg.scale;

    let (o_f, ht_f, ctx_f) = fused_recurrent_gsa_fwd(&inputs, None, &opts)?;
    let (o_c, ht_c, ctx_c) = chunk_gsa_fwd(&inputs, None, &opts)?;
    record(diffs, "gsa.o", &o_f, &o_c)?;
    if let (Some(a), Some(b)) = (&ht_f, &ht_c) {
        record(diffs, "gsa.hk", &a.hk, &b.hk)?;
        record(diffs, "gsa.hv", &a.hv, &b.hv)?;
    }

    let d_o = uniform(rng, o_f.dims(), -1.0, 1.0, device)?;
    let g_f = ctx_f.backward(&d_o, None)?;
    let g_c = ctx_c.backward(&d_o, None)?;
    for (name, a, b) in [
        ("gsa.dq", &g_f.dq, &g_c.dq),
        ("gsa.dk", &g_f.dk, &g_c.dk),
        ("gsa.dv", &g_f.dv, &g_c.dv),
        ("gsa.ds", &g_f.ds, &g_c.ds),
        ("gsa.dg", &g_f.dg, &g_c.dg),
    ] {
        record(diffs, name, a, b)?;
    }
    Ok(())
}

/// Prefill all but the last token, decode the last one from the cache, and
/// compare against one full forward.
fn check_layer_decode(config: &RunConfig, rng: &mut StdRng, device: &Device, diffs: &mut Diffs) -> Result<()> {
    let cfg = &config.layer;
    let (b, t) = (config.problem.batch_size, config.problem.seq_len);
    if t < 2 {
        return Ok(());
    }
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, cfg.dtype.dtype(), device);
    let layer = GatedSlotAttention::new(cfg, Some(0), vb)?;

    let x = uniform(rng, &[b, t, cfg.hidden_size], -1.0, 1.0, device)?
        .to_dtype(cfg.dtype.dtype())?;
    let full = layer.forward(&x, None, None, false)?;

    let mut cache = Cache::new();
    let prefix = layer.forward(&x.narrow(1, 0, t - 1)?, None, Some(&mut cache), true)?;
    let last = layer.forward(&x.narrow(1, t - 1, 1)?, None, Some(&mut cache), true)?;
    let stepped = Tensor::cat(&[prefix, last], 1)?;
    record(diffs, "layer.decode", &full.to_dtype(DType::F32)?, &stepped.to_dtype(DType::F32)?)
}

pub fn run_check(args: CheckArgs) -> Result<()> {
    let headless = args.headless;
    let mut config = RunConfig::from_yaml(&args.config_file)
        .with_context(|| format!("loading {}", args.config_file))?;
    if let Some(mode) = &args.mode {
        config.layer.mode = mode.parse()?;
    }
    if let Some(dtype) = &args.dtype {
        config.layer.dtype = dtype.parse()?;
    }

    if !headless {
        println!("=== slotscan check ===");
        println!(
            "batch={} seq_len={} heads={} k={} v={} slots={} chunk={} layer mode={} dtype={}\n",
            config.problem.batch_size,
            config.problem.seq_len,
            config.layer.num_heads,
            config.layer.head_k_dim(),
            config.layer.head_v_dim(),
            config.layer.slots(),
            config.layer.chunk_size,
            config.layer.mode,
            config.layer.dtype
        );
    }

    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(config.problem.seed);
    let mut diffs = Diffs::new();
    check_delta_rule(&config, &mut rng, &device, &mut diffs)?;
    check_gsa(&config, &mut rng, &device, &mut diffs)?;
    check_layer_decode(&config, &mut rng, &device, &mut diffs)?;

    let tolerance = config.problem.tolerance;
    let failed: Vec<&str> = diffs
        .iter()
        .filter(|(_, d)| !(*d <= tolerance))
        .map(|(n, _)| n.as_str())
        .collect();

    if headless {
        let report: serde_json::Map<String, serde_json::Value> =
            diffs.iter().map(|(n, d)| (n.clone(), json!(d))).collect();
        println!(
            "{}",
            json!({
                "dtype": config.layer.dtype.to_string(),
                "tolerance": tolerance,
                "max_rel_diff": report,
                "passed": failed.is_empty(),
            })
        );
    } else {
        for (name, d) in &diffs {
            let status = if *d <= tolerance { "ok" } else { "FAIL" };
            println!("{:<14} {:>12.3e}  {}", name, d, status);
        }
        println!();
    }

    if !failed.is_empty() {
        anyhow::bail!("{} checks exceeded tolerance {}: {}", failed.len(), tolerance, failed.join(", "));
    }
    if !headless {
        println!("All {} checks within tolerance {}", diffs.len(), tolerance);
    }
    Ok(())
}
