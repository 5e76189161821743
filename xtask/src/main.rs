use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Parser)]
#[command(name = "xtask", about = "review-bridge workspace tasks")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Validate lock files against schemas/lockfile.schema.json
    ValidateLockfile {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::ValidateLockfile { files } => {
            let mut invalid = 0;
            for f in &files {
                if !validate_lockfile(f)? {
                    invalid += 1;
                }
            }
            if invalid > 0 {
                eprintln!("{invalid} of {} lock file(s) invalid", files.len());
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn validate_lockfile(path: &Path) -> Result<bool> {
    let schema_text = include_str!("../../schemas/lockfile.schema.json");
    let schema: serde_json::Value = serde_json::from_str(schema_text).context("parse lock file schema")?;
    let compiled = jsonschema::validator_for(&schema)?;
    let data_text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let data: serde_json::Value =
        serde_json::from_str(&data_text).with_context(|| format!("parse {}", path.display()))?;
    let errors: Vec<_> = compiled.iter_errors(&data).collect();
    if !errors.is_empty() {
        eprintln!("Invalid: {}", path.display());
        for e in errors {
            eprintln!("- {e}");
        }
        return Ok(false);
    }
    println!("OK: {}", path.display());
    Ok(true)
}
