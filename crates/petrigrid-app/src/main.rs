use anyhow::{Result, bail};
use petrigrid_core::{PetriConfig, PetriWorld, StepOutcome};
use std::thread;
use std::time::Duration;
use tracing::info;

struct Options {
    steps: u64,
    seed: Option<u64>,
    paced: bool,
    report_every: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            steps: 240,
            seed: None,
            paced: false,
            report_every: 20,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let options = parse_options()?;

    let config = PetriConfig {
        rng_seed: options.seed,
        ..PetriConfig::default()
    };
    let mut world = PetriWorld::new(config)?;
    info!(
        width = world.grid().width(),
        height = world.grid().height(),
        founders = world.colonies().len(),
        "petrigrid world ready"
    );

    for _ in 0..options.steps {
        match world.step() {
            StepOutcome::Stepped(metrics) => {
                if metrics.step.0.is_multiple_of(options.report_every) {
                    info!(
                        step = metrics.step.0,
                        healthy = metrics.healthy,
                        mutated = metrics.mutated,
                        total = metrics.total,
                        clusters = metrics.clusters.total_clusters,
                        mutated_clusters = metrics.clusters.mutated_clusters,
                        "step summary"
                    );
                }
            }
            StepOutcome::Expanded { width, height } => {
                info!(width, height, "grid expanded");
            }
        }
        if options.paced {
            thread::sleep(Duration::from_millis(u64::from(
                world.config().step_interval_ms,
            )));
        }
    }

    if let Some(latest) = world.history().last() {
        info!(
            step = latest.step.0,
            total = latest.total,
            clusters = latest.clusters.total_clusters,
            "run complete"
        );
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn parse_options() -> Result<Options> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--steps" => options.steps = next_value(&mut args, "--steps")?,
            "--seed" => options.seed = Some(next_value(&mut args, "--seed")?),
            "--report-every" => options.report_every = next_value(&mut args, "--report-every")?,
            "--paced" => options.paced = true,
            other => bail!("unknown argument: {other}"),
        }
    }
    if options.report_every == 0 {
        bail!("--report-every must be non-zero");
    }
    Ok(options)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<u64> {
    match args.next() {
        Some(value) => Ok(value.parse()?),
        None => bail!("{flag} requires a value"),
    }
}
