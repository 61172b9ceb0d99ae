use addnet::{AddResBlk, BlendSharing, BlockConfig, Parameters, DEFAULT_ID_CHANNELS};
use addnet_runtime::Checkpoint;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialise a residual block and save its weights
    Init {
        /// Output checkpoint path
        #[arg(long, default_value = "block.addb")]
        out: PathBuf,
        #[arg(long, default_value_t = 64)]
        c_in: usize,
        #[arg(long, default_value_t = 64)]
        c_out: usize,
        #[arg(long, default_value_t = 64)]
        c_att: usize,
        #[arg(long, default_value_t = DEFAULT_ID_CHANNELS)]
        c_id: usize,
        /// Give the second stage its own blend weights
        #[arg(long)]
        independent: bool,
        /// Seed for weight initialisation (random when omitted)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run one forward pass over random inputs
    Run {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long, default_value_t = 1)]
        batch: usize,
        #[arg(long, default_value_t = 8)]
        height: usize,
        #[arg(long, default_value_t = 8)]
        width: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Memory-map the checkpoint instead of reading it
        #[arg(long)]
        mmap: bool,
    },
}

fn init(out: PathBuf, config: BlockConfig, seed: Option<u64>) -> Result<()> {
    let block = match seed {
        Some(seed) => AddResBlk::with_rng(config, &mut StdRng::seed_from_u64(seed)),
        None => AddResBlk::new(config),
    }
    .context("building block")?;
    Checkpoint::save(&block, &out).with_context(|| format!("writing {}", out.display()))?;
    println!("Saved block ({} parameters) to {:?}", block.num_parameters(), out);
    Ok(())
}

fn run(checkpoint: PathBuf, batch: usize, height: usize, width: usize, seed: u64, mmap: bool) -> Result<()> {
    let block = if mmap {
        Checkpoint::load_mmap(&checkpoint)
    } else {
        Checkpoint::load(&checkpoint)
    }
    .with_context(|| format!("loading {}", checkpoint.display()))?;
    let config = *block.config();
    info!(?config, "loaded block");

    let mut rng = StdRng::seed_from_u64(seed);
    let h = Array4::from_shape_fn((batch, config.c_in, height, width), |_| rng.gen_range(-1.0..1.0));
    let z_att = Array4::from_shape_fn((batch, config.c_att, height, width), |_| rng.gen_range(-1.0..1.0));
    let z_id = Array2::from_shape_fn((batch, config.c_id), |_| rng.gen_range(-1.0..1.0));

    let y = block.forward(&h, &z_att, &z_id)?;
    let mean = y.mean().unwrap_or(0.0);
    let min = y.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = y.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    println!("output shape: {:?}", y.shape());
    println!("mean {mean:.6}  min {min:.6}  max {max:.6}");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Init { out, c_in, c_out, c_att, c_id, independent, seed } => {
            let sharing = if independent { BlendSharing::Independent } else { BlendSharing::ReuseFirst };
            let config = BlockConfig::new(c_in, c_out, c_att, c_id).with_sharing(sharing);
            init(out, config, seed)
        }
        Command::Run { checkpoint, batch, height, width, seed, mmap } => {
            run(checkpoint, batch, height, width, seed, mmap)
        }
    }
}
