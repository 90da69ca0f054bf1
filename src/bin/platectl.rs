//! platectl - offline administration of the plate registry

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use plate_sentry::{
    build_recognizer, detect_plate, recognize::RecognizerBackend, DetectError, PlateRegistry,
    PlatedConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Plate registry CSV file (defaults to the configured one).
    #[arg(long)]
    plates: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every plate and its authorization.
    List {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Register a plate (unauthorized until toggled).
    Add { plate: String },
    /// Flip a plate's authorization.
    Toggle { plate: String },
    /// Remove a plate.
    Delete { plate: String },
    /// Run one-shot detection on an image file.
    Detect {
        image: PathBuf,
        #[arg(long, value_enum)]
        recognizer: Option<RecognizerBackend>,
        /// OCR service endpoint for the http backend.
        #[arg(long)]
        ocr_url: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mut cfg = PlatedConfig::load()?;
    if let Some(path) = args.plates {
        cfg.plates_path = path;
    }
    let registry = PlateRegistry::open(cfg.plates_path.clone());

    match args.command {
        Command::List { json } => {
            let records = registry.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no plates registered in {}", cfg.plates_path.display());
            } else {
                for record in records {
                    let state = if record.authorized {
                        "authorized"
                    } else {
                        "unauthorized"
                    };
                    println!("{:<10} {}", record.plate, state);
                }
            }
        }
        Command::Add { plate } => {
            let record = registry.add(&plate)?;
            println!("Plate added: {}", record.plate);
        }
        Command::Toggle { plate } => {
            let record = registry.toggle(&plate)?;
            println!(
                "Authorization toggled: {} is now {}",
                record.plate,
                if record.authorized {
                    "authorized"
                } else {
                    "unauthorized"
                }
            );
        }
        Command::Delete { plate } => {
            registry.delete(&plate)?;
            println!("Plate deleted: {}", plate.trim());
        }
        Command::Detect {
            image,
            recognizer,
            ocr_url,
        } => {
            if let Some(backend) = recognizer {
                cfg.recognizer.backend = backend;
            }
            if let Some(url) = ocr_url {
                cfg.recognizer.url = url;
            }
            let bytes = std::fs::read(&image)
                .with_context(|| format!("read image {}", image.display()))?;
            let recognizer = build_recognizer(&cfg.recognizer)?;
            match detect_plate(&recognizer, &registry, &bytes) {
                Ok(detection) => println!("{}", serde_json::to_string_pretty(&detection)?),
                Err(DetectError::NoValidPlate) => {
                    return Err(anyhow!("no valid plate found in {}", image.display()))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}
