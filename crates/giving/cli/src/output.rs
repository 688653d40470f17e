//! Output formatting utilities

use colored::*;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::error::CliResult;

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or `data` as JSON.
pub fn print_output<R: Tabled, T: Serialize + ?Sized>(rows: Vec<R>, data: &T, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No results".dimmed());
            } else {
                println!("{}", Table::new(rows));
            }
        }
        OutputFormat::Json => print_json(data)?,
    }
    Ok(())
}

pub fn print_json<T: Serialize + ?Sized>(data: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

/// Shorten long hex values for table cells.
pub fn abbreviate(value: &str) -> String {
    if value.len() > 14 {
        format!("{}…{}", &value[..8], &value[value.len() - 4..])
    } else {
        value.to_string()
    }
}
