//! Seed importer orchestration
//!
//! Imports a seed through a unit of work so that keys, foreign keys and
//! join-table rows are written by the mapper in one atomic commit.

use std::collections::HashMap;
use std::path::Path;

use relmap_core::{EntityRef, Key, Registry, RowStore, SessionConfig, UnitOfWork};
use serde::Serialize;

use crate::errors::{from_relmap, seed_validation, Result};
use crate::seed::format::SeedV0;
use crate::seed::parser::parse_seed_file;

/// Counts of what one import wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub entities: usize,
    pub references: usize,
    pub links: usize,
    pub statements: u64,
}

/// Parse and import a seed file
pub fn import_seed_file<S: RowStore + ?Sized>(
    path: &Path,
    registry: &Registry,
    store: &mut S,
    config: &SessionConfig,
) -> Result<ImportReport> {
    let seed = parse_seed_file(path)?;
    let mut uow = UnitOfWork::with_config(registry, store, config.clone());
    import_seed(&seed, &mut uow)
}

/// Import a parsed seed and commit
///
/// This is the main entry point for seed import. It:
/// 1. Creates and persists every entity in file order
/// 2. Sets the owning to-one references of each entity
/// 3. Applies the explicit links
/// 4. Commits once
///
/// References and links resolve against the seeded entities first and the
/// store second. Nothing is written when any step fails.
pub fn import_seed<S: RowStore + ?Sized>(
    seed: &SeedV0,
    uow: &mut UnitOfWork<'_, S>,
) -> Result<ImportReport> {
    let registry = uow.registry();
    let mut report = ImportReport::default();
    let mut created: Vec<EntityRef> = Vec::with_capacity(seed.entities.len());
    let mut by_key: HashMap<(String, Key), EntityRef> = HashMap::new();

    for data in &seed.entities {
        let entity = uow.create_from(data).map_err(from_relmap)?;
        uow.persist(entity).map_err(from_relmap)?;
        if let Some(key) = uow.key(entity).map_err(from_relmap)? {
            let root = registry.root_of(&data.entity_type).map_err(from_relmap)?;
            by_key.insert((root.to_string(), key), entity);
        }
        created.push(entity);
        report.entities += 1;
    }

    for (data, &entity) in seed.entities.iter().zip(&created) {
        for (relationship, key) in &data.references {
            let target_type = registry
                .relationship(&data.entity_type, relationship)
                .map_err(from_relmap)?
                .target()
                .to_string();
            let target = resolve(uow, &by_key, &target_type, key)?;
            uow.link(entity, relationship, target).map_err(from_relmap)?;
            report.references += 1;
        }
    }

    for link in &seed.links {
        let source = resolve(uow, &by_key, &link.entity_type, &link.key)?;
        let target_type = registry
            .relationship(&link.entity_type, &link.relationship)
            .map_err(from_relmap)?
            .target()
            .to_string();
        let target = resolve(uow, &by_key, &target_type, &link.target)?;
        uow.link(source, &link.relationship, target).map_err(from_relmap)?;
        report.links += 1;
    }

    let before = uow.statistics().statements_executed;
    uow.commit().map_err(from_relmap)?;
    report.statements = uow.statistics().statements_executed - before;

    tracing::info!(
        entities = report.entities as u64,
        references = report.references as u64,
        links = report.links as u64,
        statements = report.statements,
        "seed imported"
    );
    Ok(report)
}

fn resolve<S: RowStore + ?Sized>(
    uow: &mut UnitOfWork<'_, S>,
    seeded: &HashMap<(String, Key), EntityRef>,
    entity_type: &str,
    key: &Key,
) -> Result<EntityRef> {
    let root = uow.registry().root_of(entity_type).map_err(from_relmap)?;
    if let Some(entity) = seeded.get(&(root.to_string(), key.clone())) {
        return Ok(*entity);
    }
    uow.find(entity_type, key.clone())
        .map_err(from_relmap)?
        .ok_or_else(|| {
            seed_validation(&format!(
                "Reference to unknown {} with key {}",
                entity_type, key
            ))
        })
}
