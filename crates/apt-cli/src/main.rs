use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "apt2xml")]
#[command(about = "Convert Apt interactive-movie data into annotated XML", long_about = None)]
struct Cli {
    /// Path to the Apt file (prompts interactively if not provided)
    input: Option<PathBuf>,

    /// Output path (defaults to <input>.edited.xml)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory containing the type definition files
    #[arg(long, default_value = ".")]
    schema_dir: PathBuf,

    /// Print decode statistics to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let input = match cli.input {
        Some(path) => path,
        None => prompt_for_path()?,
    };

    let data =
        fs::read(&input).with_context(|| format!("Failed to read {}", input.display()))?;

    let const_path = input.with_extension("const");
    let const_data = fs::read(&const_path)
        .with_context(|| format!("Failed to read {}", const_path.display()))?;

    let schemas = apt::SchemaTexts {
        type_definitions: read_schema(&cli.schema_dir, "AptTypeDefinitions.txt")?,
        action_declarations: read_schema(&cli.schema_dir, "ActionTypeDeclarations.txt")?,
        action_definitions: read_schema(&cli.schema_dir, "ActionTypeDefinitions.txt")?,
    };

    let movie = apt::decode(data, &const_data, &schemas)
        .with_context(|| format!("Failed to decode {}", input.display()))?;

    if cli.verbose {
        eprintln!("entry offset: {}", movie.entry_offset);
        eprintln!("objects: {}", movie.pool.objects.len());
        eprintln!("arrays: {}", movie.pool.arrays.len());
        eprintln!("branch/function destinations: {}", movie.destinations.len());
        eprintln!("constants: {}", movie.constants.items.len());
    }

    let xml = apt::movie_to_xml(&movie).context("Failed to build the XML document")?;

    let output = cli
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}.edited.xml", input.display())));
    fs::write(&output, xml).with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Converted {} -> {}", input.display(), output.display());
    Ok(())
}

/// Ask for the input path on stdin, like the original interactive tool.
fn prompt_for_path() -> Result<PathBuf> {
    print!("Please specify the file you want to convert: ");
    io::stdout().flush().context("Failed to flush stdout")?;

    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        bail!("No input file specified");
    }
    Ok(PathBuf::from(trimmed))
}

fn read_schema(dir: &Path, name: &str) -> Result<String> {
    let path = dir.join(name);
    fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
}
