//! RSA code-signing key tool for expo-updates manifests.
//!
//! `generate` writes a new keypair:
//! - `code-signing-private.pem` (PKCS#8, keep on the update server)
//! - `code-signing-public.pem` (SubjectPublicKeyInfo, ship with the app)
//!
//! `sign` prints the `expo-signature` header value for a manifest body.
//!
//! Usage:
//!   expo-updates-keygen generate [output-dir]
//!   expo-updates-keygen sign --key code-signing-private.pem manifest.json

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use expo_updates::code_signing::{sign, SigningConfig, DEFAULT_KEY_ID};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs;
use std::path::{Path, PathBuf};

const KEY_BITS: usize = 2048;

/// Code-signing key tool for expo-updates.
#[derive(Parser, Debug)]
#[command(name = "expo-updates-keygen", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new RSA keypair.
    Generate {
        /// Directory to write the PEM files into.
        #[arg(default_value = ".")]
        output_dir: PathBuf,
    },
    /// Sign a manifest body and print the signature header.
    Sign {
        /// PKCS#8 PEM private key.
        #[arg(long)]
        key: PathBuf,
        /// Key identifier announced in the header.
        #[arg(long, default_value = DEFAULT_KEY_ID)]
        key_id: String,
        /// Manifest body, signed byte for byte.
        manifest: PathBuf,
    },
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    match Cli::parse().command {
        Command::Generate { output_dir } => generate(output_dir),
        Command::Sign {
            key,
            key_id,
            manifest,
        } => sign_manifest(&key, &key_id, &manifest),
    }
}

fn generate(output_dir: PathBuf) -> color_eyre::Result<()> {
    println!("RSA-{KEY_BITS} Keypair Generator for expo-updates code signing\n");
    fs::create_dir_all(&output_dir).wrap_err("Failed to create output directory")?;

    println!("Generating keypair...");
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        .wrap_err("Failed to generate keypair")?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| eyre!("Failed to encode private key: {e}"))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| eyre!("Failed to encode public key: {e}"))?;

    // Round-trip the public key through the loader the app uses.
    SigningConfig::from_pem(&public_pem, None, None)?;

    let private_path = output_dir.join("code-signing-private.pem");
    fs::write(&private_path, private_pem.as_bytes()).wrap_err("Failed to write private key")?;
    println!("\nPrivate key saved to: {}", private_path.display());
    println!("  WARNING: Keep this file secure! It signs every update.");

    let public_path = output_dir.join("code-signing-public.pem");
    fs::write(&public_path, &public_pem).wrap_err("Failed to write public key")?;
    println!("Public key saved to: {}", public_path.display());

    println!("\nDone! Point code_signing.public_key_path at the public key.");
    Ok(())
}

fn sign_manifest(key: &Path, key_id: &str, manifest: &Path) -> color_eyre::Result<()> {
    let pem = fs::read_to_string(key).wrap_err("Failed to read private key")?;
    let private_key =
        RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| eyre!("Invalid private key: {e}"))?;
    let body = fs::read(manifest).wrap_err("Failed to read manifest")?;

    let signature = sign(&body, &private_key, key_id)?;
    println!("{}", signature.to_header());
    Ok(())
}
