mod diagnostics;
mod flows;
mod input;
mod menu;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use input::Keys;
use rollcall_core::provider::check_models;
use rollcall_core::{Config, PersonId};
use rollcall_store::FaceStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face registration and recognition")]
struct Cli {
    /// Directory holding person_details.csv and face_encodings.bin
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Main menu (default)
    Menu,
    /// Registration menu, or a one-shot registration from a photo
    Register {
        /// Register from this image file instead of the webcam
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Live recognition from the webcam
    Recognize {
        /// Start with the lenient tolerance
        #[arg(long)]
        lenient: bool,
        /// Keep an annotated JPEG of the latest processed frame at this path
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// List registered persons
    List,
    /// Capture one more embedding for a registered person
    AddSample {
        /// Person ID
        id: PersonId,
    },
    /// Run camera diagnostics
    Test,
    /// Check model files, data directory and cameras
    Check,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    tracing::debug!(?config, "configuration loaded");

    let command = cli.command.unwrap_or(Commands::Menu);
    if needs_models(&command) {
        // Fail before touching the camera.
        check_models(&config.model_dir)?;
    }

    match command {
        Commands::Test => diagnostics::camera_test(&config),
        Commands::Check => diagnostics::check(&config),
        Commands::List => menu::print_persons(&open_store(&config)?),
        command => {
            let mut store = open_store(&config)?;
            let keys = Keys::stdin();
            match command {
                Commands::Register { image: Some(path) } => {
                    flows::register_from_image(&config, &mut store, &keys, &path)
                }
                Commands::Register { image: None } => menu::registration_menu(&config, &mut store, &keys),
                Commands::Recognize { lenient, snapshot } => {
                    flows::recognize(&config, &store, &keys, lenient, snapshot)
                }
                Commands::AddSample { id } => flows::add_sample(&config, &store, &keys, id),
                _ => menu::main_menu(&config, &mut store, &keys),
            }
        }
    }
}

fn open_store(config: &Config) -> Result<FaceStore> {
    FaceStore::open(&config.data_dir)
        .with_context(|| format!("failed to open data directory {}", config.data_dir.display()))
}

/// Commands that run the face models.
fn needs_models(command: &Commands) -> bool {
    !matches!(command, Commands::Test | Commands::Check | Commands::List)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::ProviderError;

    #[test]
    fn test_model_commands_checked_up_front() {
        for args in [
            vec!["rollcall"],
            vec!["rollcall", "register"],
            vec!["rollcall", "register", "--image", "alice.jpg"],
            vec!["rollcall", "recognize", "--lenient"],
            vec!["rollcall", "add-sample", "3"],
        ] {
            let cli = Cli::try_parse_from(args.iter().copied()).unwrap();
            assert!(needs_models(&cli.command.unwrap_or(Commands::Menu)), "{args:?}");
        }
        for args in [["rollcall", "list"], ["rollcall", "test"], ["rollcall", "check"]] {
            let cli = Cli::try_parse_from(args).unwrap();
            assert!(!needs_models(&cli.command.unwrap()), "{args:?}");
        }
    }

    #[test]
    fn test_missing_models_stop_startup() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_models(dir.path()).unwrap_err();
        assert!(matches!(err, ProviderError::DependencyMissing { .. }));
    }
}
