//! Bench command implementation
//!
//! Times the gated slot attention layer forward in each kernel mode.

use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use slotscan::config::RunConfig;
use slotscan::layers::GatedSlotAttention;
use slotscan::numeric::uniform;
use slotscan::ops::Mode;

/// Bench command arguments
#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Path to the configuration YAML file
    #[arg(short = 'f', long = "config", default_value = "configs/small.yaml")]
    pub config_file: String,

    /// Override iterations per mode from YAML config
    #[arg(long)]
    pub iters: Option<usize>,

    /// Override the layer precision: "f32", "f16" or "bf16"
    #[arg(long)]
    pub dtype: Option<String>,

    /// Headless mode: output only JSON metrics (no fancy UI)
    #[arg(long)]
    pub headless: bool,
}

pub fn run_bench(args: BenchArgs) -> Result<()> {
    let headless = args.headless;
    let mut config = RunConfig::from_yaml(&args.config_file)
        .with_context(|| format!("loading {}", args.config_file))?;
    if let Some(dtype) = &args.dtype {
        config.layer.dtype = dtype.parse()?;
    }
    let iters = args.iters.unwrap_or(config.problem.iters).max(1);
    let (b, t) = (config.problem.batch_size, config.problem.seq_len);
    let precision = config.layer.dtype;
    let dtype = precision.dtype();
    let device = Device::Cpu;

    if !headless {
        println!("=== slotscan bench ===");
        println!("batch={} seq_len={} iters={} dtype={}\n", b, t, iters, precision);
    }
    if t <= 64 && !headless {
        println!("Note: seq_len {} <= 64, both modes run the fused recurrent kernel", t);
    }

    let mut rng = StdRng::seed_from_u64(config.problem.seed);
    let x = uniform(&mut rng, &[b, t, config.layer.hidden_size], -1.0, 1.0, &device)?.to_dtype(dtype)?;

    let modes = [Mode::Chunk, Mode::FusedRecurrent];
    let pb = if headless {
        ProgressBar::hidden()
    } else {
        ProgressBar::new((iters * modes.len()) as u64)
    };
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/dim} {pos:>7}/{len:7} [{elapsed}] {msg}")?
            .progress_chars("━━─"),
    );

    // Shared weights so both modes compute the same function
    let varmap = VarMap::new();
    let mut results = Vec::with_capacity(modes.len());
    for mode in modes {
        let mut cfg = config.layer.clone();
        cfg.mode = mode;
        let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
        let layer = GatedSlotAttention::new(&cfg, Some(0), vb)?;

        // Warmup
        layer.forward(&x, None, None, false)?;

        let mut total = 0.0f64;
        for _ in 0..iters {
            let start = Instant::now();
            layer.forward(&x, None, None, false)?;
            total += start.elapsed().as_secs_f64();
            pb.inc(1);
            pb.set_message(format!("{}", mode));
        }
        let avg_ms = total * 1e3 / iters as f64;
        let tokens_per_s = (b * t) as f64 * iters as f64 / total.max(f64::EPSILON);
        log::info!("{}: {:.3} ms/iter, {:.0} tok/s", mode, avg_ms, tokens_per_s);
        results.push((mode, avg_ms, tokens_per_s));
    }
    pb.finish_with_message("done ✓");

    if headless {
        let rows: Vec<_> = results
            .iter()
            .map(|(mode, ms, tps)| json!({ "mode": mode.to_string(), "ms_per_iter": ms, "tokens_per_s": tps }))
            .collect();
        println!(
            "{}",
            json!({
                "batch_size": b,
                "seq_len": t,
                "iters": iters,
                "dtype": precision.to_string(),
                "results": rows,
            })
        );
    } else {
        println!();
        for (mode, ms, tps) in &results {
            println!("{:<16} {:>10.3} ms/iter {:>12.0} tok/s", mode.to_string(), ms, tps);
        }
    }
    Ok(())
}
