//! Entry point for the vocalis speaker classification trainer.

use std::path::{Path, PathBuf};

use vocalis::config::PipelineConfig;
use vocalis::{logging, pipeline};

fn main() {
    let config = match parse_args() {
        Ok(Some(config)) => config,
        Ok(None) => return,
        Err(err) => {
            eprintln!("{err}");
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(err) = logging::init(Path::new("logs")) {
        eprintln!("Logging disabled: {err}");
    }

    match pipeline::run_training(&config) {
        Ok(report) => {
            tracing::info!(
                "Done: {:?} after {} epochs, final accuracy {:.4}",
                report.state,
                report.epochs_run,
                report.final_accuracy
            );
        }
        Err(err) => {
            tracing::error!("Training failed: {err}");
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Result<Option<PipelineConfig>, String> {
    let mut config = PipelineConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = expect_value(&arg, args.next())?;
                config = PipelineConfig::load(Path::new(&value))?;
            }
            "--data-root" => {
                config.data_root = PathBuf::from(expect_value(&arg, args.next())?);
            }
            "--checkpoint" => {
                config.checkpoint_path = PathBuf::from(expect_value(&arg, args.next())?);
            }
            "--sample-rate" => {
                config.sample_rate = parse_number(&arg, args.next())?;
            }
            "--batch-size" => {
                config.batch_size = parse_number(&arg, args.next())?;
            }
            "--epochs" => {
                config.max_epochs = parse_number(&arg, args.next())?;
            }
            "--patience" => {
                config.patience = parse_number(&arg, args.next())?;
            }
            "--seed" => {
                config.seed = parse_number(&arg, args.next())?;
            }
            "--scale" => {
                config.noise_scale = parse_number(&arg, args.next())?;
            }
            "--valid-fraction" => {
                config.valid_fraction = parse_number(&arg, args.next())?;
            }
            "--learning-rate" => {
                config.learning_rate = parse_number(&arg, args.next())?;
            }
            "--workers" => {
                config.workers = parse_number(&arg, args.next())?;
            }
            "--demo-clips" => {
                config.demo_clips = parse_number(&arg, args.next())?;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            other => {
                return Err(format!("Unknown argument: {other}"));
            }
        }
    }
    Ok(Some(config))
}

fn expect_value(flag: &str, value: Option<String>) -> Result<String, String> {
    value.ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, String> {
    let value = expect_value(flag, value)?;
    value
        .parse()
        .map_err(|_| format!("{flag}: invalid value {value}"))
}

fn print_help() {
    println!("Usage: vocalis [--config <path>] [--data-root <path>] [--checkpoint <path>]");
    println!("               [--sample-rate <hz>] [--batch-size <n>] [--epochs <n>]");
    println!("               [--patience <n>] [--seed <n>] [--scale <f>] [--valid-fraction <f>]");
    println!("               [--learning-rate <f>] [--workers <n>] [--demo-clips <n>]");
}
