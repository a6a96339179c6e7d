//! Pipeline definition management commands.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use super::Runtime;

#[derive(Subcommand, Debug)]
pub enum DefinitionCommands {
    /// List stored definitions
    List,

    /// Import (or replace) a definition from a JSON file
    Import {
        /// Definition name
        name: String,

        /// Path to the definition config (JSON)
        file: PathBuf,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Validate a definition config file without storing it
    Validate {
        /// Path to the definition config (JSON)
        file: PathBuf,
    },

    /// Show a stored definition
    Show {
        /// Definition name
        name: String,
    },

    /// Mark a definition runnable
    Activate {
        /// Definition name
        name: String,
    },

    /// Mark a definition not runnable
    Deactivate {
        /// Definition name
        name: String,
    },
}

/// Read a definition config document from disk
pub fn read_config_file(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read definition file: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Definition file is not valid JSON: {}", path.display()))
}

pub fn execute(runtime: &Runtime, command: DefinitionCommands) -> Result<()> {
    match command {
        DefinitionCommands::List => list(runtime),
        DefinitionCommands::Import {
            name,
            file,
            description,
        } => {
            let config = read_config_file(&file)?;
            let problems = runtime.definitions.validate(&config);
            if !problems.is_empty() {
                print_problems(&problems);
                bail!("Definition '{}' is invalid ({} problem(s))", name, problems.len());
            }

            let definition = runtime.store.upsert_definition(&name, &description, &config)?;
            println!(
                "Imported definition '{}' (version {})",
                definition.name, definition.version
            );
            Ok(())
        }
        DefinitionCommands::Validate { file } => {
            let config = read_config_file(&file)?;
            let problems = runtime.definitions.validate(&config);
            if problems.is_empty() {
                println!("✓ {} is valid", file.display());
                return Ok(());
            }
            print_problems(&problems);
            bail!("{} problem(s) found", problems.len());
        }
        DefinitionCommands::Show { name } => {
            let definition = runtime
                .store
                .get_definition(&name)?
                .with_context(|| format!("Definition '{}' not found", name))?;
            println!("Name:        {}", definition.name);
            println!("Version:     {}", definition.version);
            println!("Active:      {}", definition.is_active);
            if !definition.description.is_empty() {
                println!("Description: {}", definition.description);
            }
            println!("Updated:     {}", definition.updated_at);
            println!();
            println!("{}", serde_json::to_string_pretty(&definition.config)?);
            Ok(())
        }
        DefinitionCommands::Activate { name } => set_active(runtime, &name, true),
        DefinitionCommands::Deactivate { name } => set_active(runtime, &name, false),
    }
}

fn list(runtime: &Runtime) -> Result<()> {
    let definitions = runtime.store.list_definitions()?;
    if definitions.is_empty() {
        println!("No definitions found");
        return Ok(());
    }

    println!("{:<24} {:<8} {:<8} {:<30}", "NAME", "VERSION", "ACTIVE", "DESCRIPTION");
    println!("{}", "-".repeat(72));
    for definition in definitions {
        println!(
            "{:<24} {:<8} {:<8} {:<30}",
            definition.name,
            definition.version,
            if definition.is_active { "yes" } else { "no" },
            truncate(&definition.description, 30)
        );
    }
    Ok(())
}

fn set_active(runtime: &Runtime, name: &str, active: bool) -> Result<()> {
    let definition = runtime.store.set_definition_active(name, active)?;
    println!(
        "Definition '{}' is now {}",
        definition.name,
        if definition.is_active { "active" } else { "inactive" }
    );
    Ok(())
}

fn print_problems(problems: &[String]) {
    for problem in problems {
        println!("✗ {}", problem);
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}
