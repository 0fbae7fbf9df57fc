//! Subcommand implementations.

use diverse_core::persist::{self, SnapshotRecord};
use diverse_core::{
    AcceptAll, Actor, ActorLookup, ActorSpec, Catalog, Eligibility, EngineConfig, ExclusionList, FormId,
    FsOverlayValidator, OverlayValidator, Selector, TaskExecutor, TokioExecutor,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

type CliResult = Result<(), Box<dyn Error>>;

/// Load the configured catalog and wait for validation.
async fn load_catalog(config: &EngineConfig) -> Result<Catalog, Box<dyn Error>> {
    let roots = (config.overlays_root(), config.materials_root());
    let validator: Arc<dyn OverlayValidator> = match roots {
        (Some(overlays), Some(materials)) => Arc::new(FsOverlayValidator::with_refresh(
            overlays,
            materials,
            config.overlay_refresh(),
        )),
        _ => {
            warn!("overlay roots not configured, accepting every overlay");
            Arc::new(AcceptAll)
        }
    };
    let executor: Arc<dyn TaskExecutor> =
        Arc::new(TokioExecutor::current().ok_or("no tokio runtime")?);

    let catalog = Catalog::load(config, validator, executor);
    let report = catalog
        .validate_presets()
        .await
        .ok_or("validation task was dropped")?;
    for id in &report.dropped {
        println!("dropped: {}", id);
    }
    Ok(catalog)
}

pub async fn catalog(config: &Path, verbose: bool) -> CliResult {
    let config = EngineConfig::from_json_file(config)?;
    let catalog = load_catalog(&config).await?;

    for preset in catalog.presets() {
        if verbose {
            print!("{}", preset);
        } else {
            println!("{:<10} {:<24} {}", preset.category(), preset.id(), preset.conditions());
        }
    }
    info!(count = catalog.len(), "catalog listed");
    Ok(())
}

/// Resolves exclusion references for a single described actor.
struct SingleActor(Actor);

impl ActorLookup for SingleActor {
    fn lookup(&self, id: FormId) -> Option<Actor> {
        (id == self.0.form_id).then(|| self.0.clone())
    }

    fn resolve_persisted(&self, id: FormId) -> Option<FormId> {
        Some(id)
    }
}

pub async fn select(config: &Path, actor: &Path, seed: Option<u64>) -> CliResult {
    let config = EngineConfig::from_json_file(config)?;
    let spec: ActorSpec = serde_json::from_str(&tokio::fs::read_to_string(actor).await?)?;
    let actor = spec.to_actor().ok_or("actor formID is not a hex id")?;

    let catalog = load_catalog(&config).await?;
    let lookup = SingleActor(actor.clone());
    let exclusions = ExclusionList::load_folders(&config.exclusion_folders(), &lookup);
    let exclusion = exclusions.exclusion(&actor);
    if exclusion.is_all() {
        println!("{} is excluded", actor.form_id);
        return Ok(());
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let selected = Selector::new(catalog).select_excluding(&actor, &exclusion, &mut rng);
    if selected.is_empty() {
        println!("no preset matches {}", actor.form_id);
    }
    for preset in selected.iter() {
        print!("{}", preset);
    }
    Ok(())
}

pub async fn inspect(file: &Path) -> CliResult {
    let records = persist::load_snapshot(file).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

pub async fn pack(records: &Path, out: &Path) -> CliResult {
    let text = tokio::fs::read_to_string(records).await?;
    let records = parse_records(&text)?;
    persist::save_snapshot(out, &records).await?;
    info!(count = records.len(), path = %out.display(), "snapshot written");
    Ok(())
}

/// Parse records, sorted by identity like the store writes them.
fn parse_records(text: &str) -> Result<Vec<SnapshotRecord>, serde_json::Error> {
    let mut records: Vec<SnapshotRecord> = serde_json::from_str(text)?;
    records.sort();
    Ok(records)
}
