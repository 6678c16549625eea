use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand};

mod config;
mod models;
mod parse;
mod report;
mod scale;
mod submit;

use config::{Config, Overrides};
use models::{GradeRow, GradeType, ImportContext};

#[derive(Parser)]
#[command(name = "grade-import")]
#[command(about = "Normalize pasted grade rows and submit them to the school backend", long_about = None)]
struct Cli {
    /// TOML config file (defaults to ./grade-import.toml when present)
    #[arg(long, global = true, env = "GRADES_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "GRADES_API_URL")]
    api_url: Option<String>,
    #[arg(long, global = true, env = "GRADES_SCHOOL_ID")]
    school: Option<String>,
    #[arg(long, global = true, env = "GRADES_DEFAULT_MAX_MARKS")]
    default_max_marks: Option<f64>,
    #[arg(long, global = true, env = "GRADES_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("source")
        .args(["text", "csv"])
        .multiple(false)
))]
struct InputArgs {
    /// Pasted `studentId,marks[,comments]` lines; stdin is read when neither source is given
    #[arg(long)]
    text: Option<String>,
    /// Headed CSV file with student_id,marks[,comments]
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Rescale fractions and percentages to the assessment maximum
    #[arg(long)]
    scale_to_max: bool,
    /// Maximum marks of the assessment
    #[arg(long)]
    max_marks: Option<f64>,
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long, value_enum)]
    grade_type: GradeType,
    /// Exam schedule id, assignment id or test label
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    section: Option<String>,
    #[arg(long)]
    term: Option<String>,
    #[arg(long)]
    academic_year: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and rescale grade rows without submitting
    Preview {
        #[command(flatten)]
        input: InputArgs,
        /// Write the normalized rows to a CSV file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Submit grade rows as one batch
    Submit {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        target: TargetArgs,
        /// Validate and print the request body without sending it
        #[arg(long)]
        dry_run: bool,
        /// Ask the backend to recompute rankings after a successful import
        #[arg(long)]
        recompute_rankings: bool,
        /// Also write a markdown import report
        #[arg(long = "report")]
        report_out: Option<PathBuf>,
    },
    /// Generate a markdown import report
    Report {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, default_value = "grade-import-report.md")]
        out: PathBuf,
    },
}

struct Prepared {
    rows: Vec<GradeRow>,
    summary: models::ImportSummary,
}

fn load_rows(input: &InputArgs) -> anyhow::Result<Vec<GradeRow>> {
    if let Some(path) = &input.csv {
        return parse::read_csv(path);
    }

    let text = match &input.text {
        Some(text) => text.clone(),
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read grade rows from stdin")?;
            buffer
        }
    };

    Ok(parse::parse_pasted(&text))
}

fn prepare(input: &InputArgs, config: &Config) -> anyhow::Result<Prepared> {
    let mut rows = load_rows(input)?;
    let target_max = scale::resolve_target_max(input.max_marks, config.default_max_marks);
    let rescaled = scale::rescale_rows(&mut rows, target_max, input.scale_to_max);
    tracing::debug!(rows = rows.len(), rescaled, target_max, "grade rows prepared");

    let summary = scale::summarize(&rows, target_max, rescaled);
    Ok(Prepared { rows, summary })
}

fn import_context(target: &TargetArgs, school_id: String) -> ImportContext {
    ImportContext {
        grade_type: target.grade_type,
        school_id,
        subject_id: target.subject.clone(),
        section_id: target.section.clone(),
        term_id: target.term.clone(),
        academic_year_id: target.academic_year.clone(),
        target_id: target.target.clone(),
    }
}

fn print_rows(rows: &[GradeRow]) {
    for row in rows {
        println!("{}", report::format_row(row));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(Overrides {
        config_path: cli.config,
        api_base_url: cli.api_url,
        school_id: cli.school,
        default_max_marks: cli.default_max_marks,
        timeout_secs: cli.timeout_secs,
    })
    .context("failed to load configuration")?;

    match cli.command {
        Commands::Preview { input, out } => {
            let prepared = prepare(&input, &config)?;
            print_rows(&prepared.rows);
            println!(
                "{} rows, {} without marks, {} rescaled (target max {}).",
                prepared.summary.row_count,
                prepared.summary.null_marks,
                prepared.summary.rescaled,
                prepared.summary.target_max
            );

            if let Some(out) = out {
                parse::write_csv(&prepared.rows, &out)?;
                println!("Rows written to {}.", out.display());
            }
        }
        Commands::Submit {
            input,
            target,
            dry_run,
            recompute_rankings,
            report_out,
        } => {
            let prepared = prepare(&input, &config)?;
            let school_id = config.require_school_id()?.to_string();
            let context = import_context(&target, school_id);

            if dry_run {
                let batch = submit::build_batch(&context, &prepared.rows)?;
                let path =
                    submit::grades_path(&context.school_id, context.grade_type, batch.target_id);
                println!("POST {path}");
                println!("{}", serde_json::to_string_pretty(&batch.to_json())?);
                return Ok(());
            }

            let base_url = config.require_api_base_url()?;
            let mut dispatcher =
                submit::Dispatcher::new(base_url, Duration::from_secs(config.timeout_secs))?;
            let outcome = dispatcher.submit(&context, &prepared.rows).await?;
            println!("{}", outcome.message);

            match &outcome.refreshed {
                Some(grades) => {
                    println!("Current grades ({}):", grades.len());
                    for grade in grades {
                        let name = grade.student_name.as_deref().unwrap_or(&grade.student_id);
                        let marks = grade
                            .marks_obtained
                            .map(|value| value.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        match grade.comments.as_deref() {
                            Some(comment) => println!("- {name}: {marks} ({comment})"),
                            None => println!("- {name}: {marks}"),
                        }
                    }
                }
                None => println!("Grade list could not be refreshed."),
            }

            if recompute_rankings {
                match dispatcher.recompute_rankings(&context).await {
                    Ok(message) => println!("{message}"),
                    Err(e) => tracing::warn!("ranking recompute failed: {e}"),
                }
            }

            if let Some(out) = report_out {
                let body = report::build_report(
                    &context,
                    &prepared.summary,
                    &prepared.rows,
                    Some(outcome.import_id),
                    chrono::Utc::now(),
                );
                std::fs::write(&out, body)
                    .with_context(|| format!("failed to write {}", out.display()))?;
                println!("Report written to {}.", out.display());
            }
        }
        Commands::Report { input, target, out } => {
            let prepared = prepare(&input, &config)?;
            // The school id only feeds request paths; a report needs none.
            let context = import_context(&target, String::new());
            let body = report::build_report(
                &context,
                &prepared.summary,
                &prepared.rows,
                None,
                chrono::Utc::now(),
            );
            std::fs::write(&out, body)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
