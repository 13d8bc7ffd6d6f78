use crate::config::ProviderSeedFile;
use machinemon_common::types::AlertProvider;
use machinemon_notify::utils::redact_json_string;
use machinemon_notify::ProviderConfig;
use machinemon_storage::SnapshotStore;
use std::collections::HashSet;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub created: u32,
    pub skipped: u32,
    pub invalid: u32,
}

/// Creates the providers listed in `seed`. Names that already exist are
/// skipped; entries whose type is unknown or whose config does not decode
/// are rejected before anything is written for them.
pub fn seed_providers(
    store: &dyn SnapshotStore,
    seed: &ProviderSeedFile,
) -> anyhow::Result<SeedSummary> {
    let mut existing: HashSet<String> = store
        .list_providers()?
        .into_iter()
        .map(|p| p.name)
        .collect();
    let mut summary = SeedSummary::default();

    for entry in &seed.providers {
        if existing.contains(&entry.name) {
            tracing::warn!(name = %entry.name, "Provider already exists, skipping");
            summary.skipped += 1;
            continue;
        }

        let config = entry.config.to_string();
        if let Err(e) = ProviderConfig::decode(&entry.provider_type, &config) {
            tracing::error!(name = %entry.name, error = %e, "Invalid provider in seed file");
            summary.invalid += 1;
            continue;
        }

        let created = store.create_provider(&entry.provider_type, &entry.name, entry.enabled, &config)?;
        tracing::info!(
            name = %created.name,
            id = created.id,
            provider_type = %created.provider_type,
            enabled = created.enabled,
            config = %redact_json_string(&created.config),
            "Provider created"
        );
        existing.insert(created.name);
        summary.created += 1;
    }

    Ok(summary)
}

/// All providers with secrets in their config replaced by `***`.
pub fn list_redacted(store: &dyn SnapshotStore) -> anyhow::Result<Vec<AlertProvider>> {
    Ok(store
        .list_providers()?
        .into_iter()
        .map(|mut p| {
            p.config = redact_json_string(&p.config);
            p
        })
        .collect())
}
