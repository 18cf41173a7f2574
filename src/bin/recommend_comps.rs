//! One-shot comp recommendation from the command line
//!
//! Usage:
//!   recommend-comps <subject.json> [--as-of YYYY-MM-DD] [--top-k N]
//!   recommend-comps --appraisal <index> [--as-of YYYY-MM-DD] [--top-k N]
//!
//! The subject file may hold a bare property record or a full request
//! object with a `subject` field. Results are printed as JSON on stdout.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use comp_recommender::comps::{EngineContext, SubjectRequest};
use comp_recommender::config::EngineConfig;
use comp_recommender::ingestion::{load_dataset, write, RawRecord};
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
enum SubjectSource {
    File(PathBuf),
    Appraisal(usize),
}

#[derive(Debug)]
struct Args {
    source: SubjectSource,
    as_of: Option<NaiveDate>,
    top_k: Option<usize>,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut source = None;
    let mut as_of = None;
    let mut top_k = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--appraisal" => {
                let value = iter.next().context("--appraisal needs an index")?;
                let index = value
                    .parse()
                    .with_context(|| format!("--appraisal must be a number, got '{}'", value))?;
                source = Some(SubjectSource::Appraisal(index));
            }
            "--as-of" => {
                let value = iter.next().context("--as-of needs a date")?;
                as_of = Some(
                    NaiveDate::parse_from_str(value, "%Y-%m-%d")
                        .with_context(|| format!("--as-of must be YYYY-MM-DD, got '{}'", value))?,
                );
            }
            "--top-k" => {
                let value = iter.next().context("--top-k needs a number")?;
                top_k = Some(
                    value
                        .parse()
                        .with_context(|| format!("--top-k must be a number, got '{}'", value))?,
                );
            }
            other if other.starts_with("--") => bail!("unknown option {}", other),
            path => source = Some(SubjectSource::File(PathBuf::from(path))),
        }
    }

    let source = source.context(
        "usage: recommend-comps <subject.json> | --appraisal <index> [--as-of DATE] [--top-k N]",
    )?;
    Ok(Args {
        source,
        as_of,
        top_k,
    })
}

/// Accept either a request object or a bare subject record
fn request_from_value(value: Value) -> Result<SubjectRequest> {
    if value.get("subject").map(Value::is_object).unwrap_or(false) {
        return serde_json::from_value(value).context("Invalid request object");
    }
    match value {
        Value::Object(subject) => Ok(SubjectRequest {
            subject,
            ..Default::default()
        }),
        _ => bail!("subject file must contain a JSON object"),
    }
}

fn appraisal_subject(config: &EngineConfig, index: usize) -> Result<RawRecord> {
    let dataset = load_dataset(&config.dataset_path, &config.normalize_options())
        .with_context(|| format!("Failed to load {}", config.dataset_path.display()))?;
    let count = dataset.subjects.len();
    dataset
        .subjects
        .into_iter()
        .nth(index)
        .with_context(|| format!("appraisal {} out of range ({} subjects)", index, count))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();
    let mut config = EngineConfig::from_env()?;
    let args = parse_args(&env::args().skip(1).collect::<Vec<_>>())?;
    if let Some(top_k) = args.top_k {
        if top_k == 0 {
            bail!("--top-k must be at least 1");
        }
        config.top_k = top_k;
    }

    let mut request = match &args.source {
        SubjectSource::File(path) => {
            let value: Value = write::read_json(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            request_from_value(value)?
        }
        SubjectSource::Appraisal(index) => SubjectRequest {
            subject: appraisal_subject(&config, *index)?,
            ..Default::default()
        },
    };
    if args.as_of.is_some() {
        request.as_of = args.as_of;
    }

    let context = EngineContext::load(&config)?;
    let query = request.into_query(&config.query_defaults())?;
    info!(
        "Recommending comps for '{}' as of {}",
        query.subject.address, query.as_of
    );

    let result = context.recommend(&query)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
