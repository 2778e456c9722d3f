use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use datamap_core::config::{expand_path, AppSettings, Config};
use datamap_core::metadata::InMemoryMetadataStore;
use datamap_core::params::ParameterSet;
use datamap_core::schema::Dataset;
use datamap_core::traits::{MetadataStore, TextEngine};
use datamap_core::types::{FieldValue, Item};
use datamap_embed::{get_embedder, EmbeddingGenerator};
use datamap_fields::backfill::{backfill_field, persist_items};
use datamap_fields::{plan_for_schema, FieldSelection, GeneratorRegistry, PipelineExecutor};
use datamap_map::{MapCache, MapOrchestrator};
use datamap_text::TantivyTextEngine;
use datamap_vector::LanceVectorEngine;

/// Generator id dataset schemas use for embedding fields.
const EMBEDDING_GENERATOR: &str = "embed";

#[derive(Parser)]
#[command(name = "datamap", about = "Index datasets and build visual data maps")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a dataset schema and index its items, generating missing fields.
    Index {
        #[arg(long)]
        dataset: PathBuf,
        /// One JSON object per line: `{"id": "...", "fields": {...}}`.
        #[arg(long)]
        items: PathBuf,
    },
    /// Generate a field for stored items that lack it.
    Backfill {
        #[arg(long)]
        dataset: u32,
        #[arg(long)]
        field: String,
        #[arg(long, default_value_t = 100_000)]
        limit: usize,
    },
    /// Compute a map and print the finished session as JSON.
    Map {
        #[arg(long)]
        params: PathBuf,
        #[arg(long)]
        ignore_cache: bool,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
}

#[derive(Deserialize)]
struct ItemLine {
    id: String,
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
}

struct Engines {
    text: Arc<TantivyTextEngine>,
    vector: Arc<LanceVectorEngine>,
    generators: GeneratorRegistry,
}

async fn open_engines(settings: &AppSettings) -> anyhow::Result<Engines> {
    let text = TantivyTextEngine::new(expand_path(&settings.data.text_index_dir)).context("opening text index")?;
    let vector_dir = expand_path(&settings.data.vector_db_dir);
    fs::create_dir_all(&vector_dir).with_context(|| format!("creating {}", vector_dir.display()))?;
    let vector = LanceVectorEngine::open_path(&vector_dir).await.context("opening vector database")?;
    let embedder = get_embedder(&settings.embedding).context("loading embedding model")?;
    let generators = GeneratorRegistry::new().with(Arc::new(EmbeddingGenerator::new(EMBEDDING_GENERATOR, Arc::from(embedder))));
    Ok(Engines { text: Arc::new(text), vector: Arc::new(vector), generators })
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}") {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn read_items(path: &Path, dataset_id: u32) -> anyhow::Result<Vec<Item>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut items = Vec::new();
    for (n, line) in raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let parsed: ItemLine = serde_json::from_str(line).with_context(|| format!("{} line {}", path.display(), n + 1))?;
        items.push(Item { dataset_id, id: parsed.id, fields: parsed.fields });
    }
    Ok(items)
}

async fn index(settings: &AppSettings, dataset_path: &Path, items_path: &Path) -> anyhow::Result<()> {
    let raw = fs::read(dataset_path).with_context(|| format!("reading {}", dataset_path.display()))?;
    let dataset: Dataset = serde_json::from_slice(&raw).context("parsing dataset schema")?;
    let mut items = read_items(items_path, dataset.id)?;
    println!("Indexing {} items into dataset {} ({})", items.len(), dataset.id, dataset.name);

    let engines = open_engines(settings).await?;
    engines.text.ensure_index(&dataset).await?;
    let plan = plan_for_schema(&dataset, &FieldSelection::All)?;
    let executor = PipelineExecutor::new(&engines.generators, settings.fields.batch_size);

    let pb = progress_bar(items.len() as u64);
    let mut errors = Vec::new();
    for chunk in items.chunks_mut(settings.fields.batch_size.max(1)) {
        let report = executor.run(&plan, chunk).await;
        errors.extend(report.error_messages());
        persist_items(&dataset, chunk, engines.text.as_ref(), engines.vector.as_ref()).await?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_with_message("done");
    for e in &errors {
        tracing::warn!(error = %e, "field generation failed");
    }

    let datasets_dir = expand_path(&settings.data.datasets_dir);
    fs::create_dir_all(&datasets_dir)?;
    let schema_path = datasets_dir.join(format!("{}.json", dataset.id));
    fs::write(&schema_path, serde_json::to_vec_pretty(&dataset)?)?;
    println!("✅ Indexed {} items ({} generation errors)", items.len(), errors.len());
    println!("📄 Schema stored at {}", schema_path.display());
    Ok(())
}

async fn backfill(settings: &AppSettings, dataset_id: u32, field: &str, limit: usize) -> anyhow::Result<()> {
    let metadata = InMemoryMetadataStore::load_dir(&expand_path(&settings.data.datasets_dir))?;
    let dataset = metadata.dataset(dataset_id)?;
    let engines = open_engines(settings).await?;
    let executor = PipelineExecutor::new(&engines.generators, settings.fields.batch_size);

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("backfilling {field}"));
    spinner.enable_steady_tick(Duration::from_millis(120));
    let report = backfill_field(&dataset, field, engines.text.as_ref(), engines.vector.as_ref(), &executor, limit).await?;
    spinner.finish_and_clear();

    for e in &report.errors {
        tracing::warn!(error = %e, "field generation failed");
    }
    println!("✅ Backfilled {field}: {} scanned, {} generated, {} errors", report.scanned, report.generated, report.errors.len());
    Ok(())
}

async fn map(settings: &AppSettings, params_path: &Path, ignore_cache: bool, timeout_secs: u64) -> anyhow::Result<()> {
    let raw = fs::read(params_path).with_context(|| format!("reading {}", params_path.display()))?;
    let params = ParameterSet::from_json(&raw).context("parsing map parameters")?;
    let metadata = Arc::new(InMemoryMetadataStore::load_dir(&expand_path(&settings.data.datasets_dir))?);
    let engines = open_engines(settings).await?;
    let orchestrator = MapOrchestrator::new(
        metadata,
        engines.text,
        engines.vector,
        engines.generators,
        Arc::new(MapCache::new(&settings.map)),
        settings.map.clone(),
        settings.fields.batch_size,
    );

    let id = orchestrator.request_map(params, ignore_cache)?;
    tracing::info!(session_id = %id, "map requested");
    let pb = progress_bar(100);
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let session = loop {
        let session = orchestrator.poll(&id)?;
        pb.set_message(session.progress.step.clone());
        pb.set_position((session.progress.fraction.clamp(0.0, 1.0) * 100.0) as u64);
        if session.finished {
            break session;
        }
        if Instant::now() >= deadline {
            pb.abandon_with_message("timed out");
            bail!("map session {id} did not finish within {timeout_secs}s");
        }
        tokio::time::sleep(Duration::from_millis(settings.map.poll_interval_ms)).await;
    };
    pb.finish_and_clear();

    for e in &session.errors {
        eprintln!("⚠️  {e}");
    }
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    let settings = config.settings()?;
    match cli.command {
        Command::Index { dataset, items } => index(&settings, &dataset, &items).await,
        Command::Backfill { dataset, field, limit } => backfill(&settings, dataset, &field, limit).await,
        Command::Map { params, ignore_cache, timeout_secs } => map(&settings, &params, ignore_cache, timeout_secs).await,
    }
}
