use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Staged HTTP load-test harness", long_about = None)]
pub struct Args {
    /// Path to the YAML test plan
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Override the plan's base URL
    #[arg(short, long)]
    pub url: Option<String>,

    /// Run the script once with a single virtual user and exit
    #[arg(long)]
    pub once: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}
