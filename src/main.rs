use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use formsheet::{
    extract::{FixedText, TesseractCli, TextExtractor},
    workbook::read_sheet,
    HeaderPolicy, Pipeline, PipelineConfig, PipelineReport,
};
use glob::glob;
use std::{
    io::{self, Read},
    path::PathBuf,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "formsheet", about = "Append photographed form fields to a spreadsheet")]
struct Cli {
    /// YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Target spreadsheet (must end in .xlsx)
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[arg(long, global = true)]
    sheet: Option<String>,

    #[arg(long, global = true, value_enum)]
    header_policy: Option<HeaderPolicy>,

    /// Skip Otsu binarization before OCR
    #[arg(long, global = true)]
    no_binarize: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// OCR one or more images (paths or glob patterns) and merge each in turn
    Process {
        #[arg(required = true)]
        images: Vec<String>,
    },
    /// Merge already extracted text from a file, or stdin with `-`
    Text { input: PathBuf },
    /// Print the configured sheet
    Show {
        #[arg(long)]
        json: bool,
    },
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(output) = &cli.output {
        cfg.output_path = output.clone();
    }
    if let Some(sheet) = &cli.sheet {
        cfg.sheet_name = sheet.clone();
    }
    if let Some(policy) = cli.header_policy {
        cfg.header_policy = policy;
    }
    if cli.no_binarize {
        cfg.binarize = false;
    }
    Ok(cfg)
}

/// Expand glob patterns; a pattern that matches nothing is kept verbatim so the
/// acquisition stage reports it.
fn expand_images(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for pattern in patterns {
        let matched: Vec<PathBuf> = glob(pattern)
            .with_context(|| format!("invalid glob pattern '{}'", pattern))?
            .filter_map(|entry| entry.ok())
            .collect();
        if matched.is_empty() {
            out.push(PathBuf::from(pattern));
        } else {
            out.extend(matched);
        }
    }
    Ok(out)
}

fn log_report(source: &str, report: &PipelineReport) {
    info!(
        source,
        action = ?report.merge.action,
        first_row = report.merge.first_row,
        rows = report.rows,
        headings = ?report.headings,
        "run complete"
    );
}

fn run_images<E: TextExtractor>(pipeline: &Pipeline<E>, images: &[String]) -> Result<()> {
    let mut failed = 0usize;
    for image in expand_images(images)? {
        let name = image.display().to_string();
        match pipeline.run_image(&image) {
            Ok(report) => log_report(&name, &report),
            Err(e) => {
                error!(image = %name, stage = %e.stage, "{}", e.source);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} image(s) failed", failed);
    }
    Ok(())
}

fn main() -> Result<()> {
    // ─── logging ─────────────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    info!(output = %cfg.output_path.display(), sheet = %cfg.sheet_name, "startup");

    match &cli.command {
        Command::Process { images } => {
            let extractor = TesseractCli::new(&cfg.tesseract);
            run_images(&Pipeline::new(cfg, extractor), images)
        }
        Command::Text { input } => {
            let text = if input.as_os_str() == "-" {
                let mut buf = String::new();
                io::stdin()
                    .read_to_string(&mut buf)
                    .context("reading stdin")?;
                buf
            } else {
                std::fs::read_to_string(input)
                    .with_context(|| format!("reading {}", input.display()))?
            };
            let pipeline = Pipeline::new(cfg, FixedText::default());
            let report = pipeline
                .run_text(&text)
                .with_context(|| format!("processing {}", input.display()))?;
            log_report(&input.display().to_string(), &report);
            Ok(())
        }
        Command::Show { json } => {
            let rows = read_sheet(&cfg.output_path, &cfg.sheet_name)
                .with_context(|| format!("reading {}", cfg.output_path.display()))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!("{}", row.join("\t"));
                }
            }
            Ok(())
        }
    }
}
