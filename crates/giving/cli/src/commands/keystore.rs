//! Keystore commands

use std::path::PathBuf;

use clap::Subcommand;
use giving_wallet::{Keystore, LockedSession, DEFAULT_KDF_ROUNDS};
use serde::Serialize;

use crate::error::{CliError, CliResult};
use crate::output::{print_json, print_success, OutputFormat};

/// Keystore subcommands
#[derive(Subcommand)]
pub enum KeystoreCommands {
    /// Create a new encrypted keystore
    New {
        /// Where to write the keystore
        path: PathBuf,

        /// Encryption password
        #[arg(short, long, env = "GIVING_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,

        /// PBKDF2 iterations
        #[arg(long, default_value_t = DEFAULT_KDF_ROUNDS)]
        kdf_rounds: u32,
    },

    /// Show the address of a keystore
    Show {
        /// Keystore file
        path: PathBuf,
    },

    /// Check that a password unlocks a keystore
    Verify {
        /// Keystore file
        path: PathBuf,

        /// Keystore password
        #[arg(short, long, env = "GIVING_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[derive(Serialize)]
struct KeystoreInfo {
    path: PathBuf,
    address: String,
}

/// Execute a keystore command
pub fn execute(command: KeystoreCommands, format: OutputFormat) -> CliResult<()> {
    match command {
        KeystoreCommands::New {
            path,
            password,
            force,
            kdf_rounds,
        } => {
            let password = password.ok_or(CliError::MissingPassword)?;
            if path.exists() && !force {
                return Err(CliError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists; pass --force to overwrite", path.display()),
                )));
            }
            let keystore = Keystore::create_with_rounds(&password, kdf_rounds)?;
            keystore.save(&path)?;
            report(&path, &keystore, "Created keystore", format)
        }
        KeystoreCommands::Show { path } => {
            let keystore = Keystore::load(&path)?;
            report(&path, &keystore, "Keystore", format)
        }
        KeystoreCommands::Verify { path, password } => {
            let password = password.ok_or(CliError::MissingPassword)?;
            let mut wallet = LockedSession::new(Keystore::load(&path)?);
            wallet.unlock(&password)?.lock();
            report(&path, wallet.keystore(), "Password unlocks", format)
        }
    }
}

fn report(path: &std::path::Path, keystore: &Keystore, label: &str, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table => {
            print_success(&format!("{} {}", label, path.display()));
            println!("  Address: {}", keystore.address());
            Ok(())
        }
        OutputFormat::Json => print_json(&KeystoreInfo {
            path: path.to_path_buf(),
            address: keystore.address().to_string(),
        }),
    }
}
