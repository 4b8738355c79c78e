//! Phase: discover
//!
//! Logs in again, lists the entity types the source offers and extracts every
//! available one. Entity types run in parallel unless the connector shares one
//! session between its pagers; pages of one entity type are staged strictly
//! in order, one transaction per page. Each entity type's raw records are
//! also kept as a JSON-lines raw-extract artifact. An entity type whose
//! listing turns out not to exist is reported unavailable instead of
//! failing the phase.

use futures::future::join_all;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::{MigrationOrchestrator, PhaseContext, PhaseEnd, PhaseOutput, PhaseStep};
use crate::connectors::{ConnectorError, RawRecord, VendorConnector};
use crate::db::{artifacts, staging};
use crate::error::MigrationResult;
use crate::models::{ArtifactKind, ArtifactRef, DiscoverResult, EntityType, MigrationRun};
use crate::utils::retry_on_lock;

/// Nesting depth explored when collecting field paths
const MAX_FIELD_DEPTH: usize = 4;

/// Outcome of extracting one entity type
struct EntityExtraction {
    entity_type: EntityType,
    extracted: u64,
    fields: BTreeSet<String>,
    artifact: Option<ArtifactRef>,
    interrupted: bool,
    /// Set when the source has no listing for this entity type
    unavailable: Option<String>,
}

impl MigrationOrchestrator {
    /// Connected → Discovering → Discovered
    pub(super) async fn phase_discover(
        &self,
        run: &MigrationRun,
        ctx: &PhaseContext,
    ) -> MigrationResult<PhaseStep> {
        let connector = self.connector(run)?;
        let connector = connector.as_ref();
        let credentials = run.source_profile.credentials.as_ref();

        self.vendor_call(ctx, "login", || connector.login(credentials))
            .await?;
        let entities = self
            .vendor_call(ctx, "discover_entities", || connector.discover_entities())
            .await?;

        let available: BTreeSet<EntityType> = entities
            .iter()
            .filter(|e| e.available)
            .map(|e| e.entity_type)
            .collect();

        tracing::info!(
            run_id = %run.id,
            discovered = entities.len(),
            available = available.len(),
            "Entity discovery complete"
        );

        let extractions = if connector.parallel_extraction() {
            join_all(
                available
                    .iter()
                    .map(|&entity_type| self.extract_entity_type(run, connector, entity_type, ctx)),
            )
            .await
        } else {
            let mut done = Vec::with_capacity(available.len());
            for &entity_type in &available {
                let extraction = self.extract_entity_type(run, connector, entity_type, ctx).await;
                let failed = extraction.is_err();
                done.push(extraction);
                if failed {
                    break;
                }
            }
            done
        };

        let mut result = DiscoverResult {
            entities,
            complete: true,
            ..Default::default()
        };
        for extraction in extractions {
            let extraction = extraction?;
            if extraction.unavailable.is_some() {
                if let Some(entity) = result
                    .entities
                    .iter_mut()
                    .find(|e| e.entity_type == extraction.entity_type)
                {
                    entity.available = false;
                }
                continue;
            }
            result.extracted.insert(extraction.entity_type, extraction.extracted);
            if !extraction.fields.is_empty() {
                result
                    .observed_fields
                    .insert(extraction.entity_type, extraction.fields);
            }
            if let Some(artifact) = extraction.artifact {
                result.raw_extracts.insert(extraction.entity_type, artifact);
            }
            result.complete &= !extraction.interrupted;
        }

        let end = if result.complete {
            PhaseEnd::Succeeded
        } else {
            PhaseEnd::Interrupted
        };
        Ok(PhaseStep::new(PhaseOutput::Discover(result), end))
    }

    async fn extract_entity_type(
        &self,
        run: &MigrationRun,
        connector: &dyn VendorConnector,
        entity_type: EntityType,
        ctx: &PhaseContext,
    ) -> MigrationResult<EntityExtraction> {
        let operation = format!("extract_{}", entity_type);
        let pager = self
            .vendor_call(ctx, &operation, || connector.extract_entity(entity_type))
            .await?;
        let pager = pager.as_ref();

        let mut extraction = EntityExtraction {
            entity_type,
            extracted: 0,
            fields: BTreeSet::new(),
            artifact: None,
            interrupted: false,
            unavailable: None,
        };
        let mut lines = String::new();
        let mut pages = 0u64;

        loop {
            if self.pause_requested(run.id).await? {
                tracing::info!(
                    run_id = %run.id,
                    entity_type = %entity_type,
                    pages,
                    "Pause requested, stopping extraction at page boundary"
                );
                extraction.interrupted = true;
                break;
            }

            let page = self
                .vendor_call(ctx, &operation, || async {
                    match pager.next_page().await {
                        Err(ConnectorError::EntityUnavailable(reason)) => Ok(Err(reason)),
                        other => other.map(Ok),
                    }
                })
                .await?;
            let records = match page {
                Ok(Some(records)) => records,
                Ok(None) => break,
                Err(reason) => {
                    tracing::warn!(
                        run_id = %run.id,
                        entity_type = %entity_type,
                        reason = %reason,
                        "Entity type not offered by the source"
                    );
                    extraction.unavailable = Some(reason);
                    break;
                }
            };
            pages += 1;
            if records.is_empty() {
                continue;
            }

            for record in &records {
                collect_field_paths(&record.data, &mut extraction.fields);
                lines.push_str(&serde_json::to_string(&json!({
                    "sourceId": record.source_id,
                    "data": record.data,
                    "extractedAt": record.extracted_at,
                }))?);
                lines.push('\n');
            }

            retry_on_lock("stage_page", self.config.db_max_lock_wait_ms, || {
                stage_page(&self.pool, run.id, &records)
            })
            .await?;
            extraction.extracted += records.len() as u64;

            tracing::debug!(
                run_id = %run.id,
                entity_type = %entity_type,
                page = pages,
                records = records.len(),
                "Staged page"
            );
        }

        if !lines.is_empty() {
            let stored = self
                .registry
                .artifacts()
                .put(ArtifactKind::RawExtract, lines.as_bytes())
                .await?;
            let mut conn = self.pool.acquire().await?;
            artifacts::record_artifact(&mut conn, run.id, ArtifactKind::RawExtract, &stored).await?;
            extraction.artifact = Some(stored);
        }

        tracing::info!(
            run_id = %run.id,
            entity_type = %entity_type,
            extracted = extraction.extracted,
            interrupted = extraction.interrupted,
            "Entity extraction finished"
        );
        Ok(extraction)
    }
}

/// Upsert one page of raw records atomically
async fn stage_page(pool: &SqlitePool, run_id: Uuid, records: &[RawRecord]) -> MigrationResult<()> {
    let mut tx = pool.begin().await?;
    for record in records {
        staging::upsert_raw(&mut tx, run_id, record).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Dotted paths of the scalar leaves of a raw record
///
/// Arrays contribute their first element as `.0`, which is how the transform
/// engine addresses them.
pub(crate) fn collect_field_paths(data: &serde_json::Map<String, Value>, out: &mut BTreeSet<String>) {
    for (key, value) in data {
        walk(key.clone(), value, 1, out);
    }
}

fn walk(path: String, value: &Value, depth: usize, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) if depth < MAX_FIELD_DEPTH && !map.is_empty() => {
            for (key, child) in map {
                walk(format!("{}.{}", path, key), child, depth + 1, out);
            }
        }
        Value::Array(items) if depth < MAX_FIELD_DEPTH && !items.is_empty() => {
            walk(format!("{}.0", path), &items[0], depth + 1, out);
        }
        _ => {
            out.insert(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_paths_flatten_fhir_shapes() {
        let data = json!({
            "id": "p1",
            "name": [{"given": ["Ada"], "family": "Lovelace"}],
            "meta": {"versionId": "3"},
            "tags": [],
        });
        let mut out = BTreeSet::new();
        collect_field_paths(data.as_object().unwrap(), &mut out);

        let paths: Vec<_> = out.iter().map(String::as_str).collect();
        assert_eq!(
            paths,
            vec!["id", "meta.versionId", "name.0.family", "name.0.given.0", "tags"]
        );
    }

    #[test]
    fn test_depth_limit_keeps_subtree_as_leaf() {
        let data = json!({"a": {"b": {"c": {"d": {"e": 1}}}}});
        let mut out = BTreeSet::new();
        collect_field_paths(data.as_object().unwrap(), &mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec!["a.b.c.d".to_string()]);
    }
}
