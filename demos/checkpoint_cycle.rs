//! Drives one checkpoint attempt against a real (or `sh`-scripted) engine
//! binary, the way `fuser`'s `examples/hello.rs` drives one mount cycle
//! against a real kernel. Not part of the library's public contract.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use cr_core::{CheckpointContext, ClaimedFds, Config, NoopHooks, PriorityTier, Resource};

#[derive(Parser)]
#[command(version, author = "cr-core maintainers")]
struct Args {
    /// Directory the engine writes/reads the process image to/from.
    image_dir: PathBuf,

    /// Engine binary name or path (falls back to `criu` if unset).
    #[clap(long)]
    engine: Option<String>,

    /// Comma-separated extra tokens passed through to the engine.
    #[clap(long, default_value = "")]
    engine_extra: String,

    /// Validate resources and descriptors without invoking the engine.
    #[clap(long)]
    dry_run: bool,
}

struct DemoResource;

impl Resource for DemoResource {
    fn before_checkpoint(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("demo resource quiescing before checkpoint");
        Ok(())
    }

    fn after_restore(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("demo resource resuming after restore");
        Ok(())
    }

    fn name(&self) -> &str {
        "demo"
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    // SAFETY: single-threaded at this point, before any resource registers
    // or any checkpoint attempt runs.
    unsafe {
        std::env::set_var("CR_IMAGE_DIR", &args.image_dir);
        if let Some(engine) = &args.engine {
            std::env::set_var("CR_ENGINE", engine);
        }
        std::env::set_var("CR_ENGINE_EXTRA", &args.engine_extra);
    }
    let config = Config::from_env();
    let ctx = CheckpointContext::install(config, Box::new(NoopHooks));

    ctx.bus
        .register(PriorityTier::Normal, Arc::new(DemoResource), &Default::default())
        .expect("registration outside a checkpoint attempt never blocks");

    let preexisting = cr_core::capture_preexisting().expect("reading /proc/self/fd");
    match cr_core::checkpoint(ctx, ClaimedFds::new(), &preexisting, args.dry_run) {
        Ok(result) => {
            println!("{result:?}");
        }
        Err(err) => {
            eprintln!("checkpoint attempt failed: {err}");
            std::process::exit(1);
        }
    }
}

