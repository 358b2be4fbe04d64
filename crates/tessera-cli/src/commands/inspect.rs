//! Inspection of exported ledger and secrets files.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tessera_ledger::{LedgerSnapshot, PublicTables, RecordDomain, SecretsVault, Visibility};

/// What an operator needs to know about a ledger before recovering from it.
#[derive(Debug, Serialize)]
pub struct LedgerSummary {
    pub records: usize,
    pub max_index: u64,
    pub public: usize,
    pub private: usize,
    pub by_domain: BTreeMap<String, usize>,
    pub digest: String,
    pub members: usize,
    pub trusted_nodes: Vec<u64>,
    pub last_opened_generation: Option<u64>,
    pub next_node_id: u64,
}

/// Validate `snapshot` and fold its internal tables.
pub fn summarize_ledger(snapshot: &LedgerSnapshot) -> Result<LedgerSummary> {
    snapshot.validate()?;
    let tables = PublicTables::from_records(snapshot.records())?;

    let mut by_domain = BTreeMap::new();
    for record in snapshot.records() {
        let domain = match record.domain {
            RecordDomain::Application => "application",
            RecordDomain::Nodes => "nodes",
            RecordDomain::Governance => "governance",
        };
        *by_domain.entry(domain.to_string()).or_insert(0) += 1;
    }

    Ok(LedgerSummary {
        records: snapshot.len(),
        max_index: snapshot.max_index(),
        public: snapshot.count(Visibility::Public),
        private: snapshot.count(Visibility::Private),
        by_domain,
        digest: snapshot.digest().to_hex(),
        members: tables.members.len(),
        trusted_nodes: tables.trusted_nodes().map(|n| n.id.value()).collect(),
        last_opened_generation: tables.last_opened_generation,
        next_node_id: tables.next_node_id().value(),
    })
}

pub fn inspect_ledger(path: &Path, json: bool) -> Result<()> {
    let snapshot = LedgerSnapshot::read_from_file(path)
        .with_context(|| format!("reading ledger {}", path.display()))?;
    let summary = summarize_ledger(&snapshot)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Ledger {}", path.display());
    println!("  records:        {} (last index {})", summary.records, summary.max_index);
    println!("  public/private: {}/{}", summary.public, summary.private);
    for (domain, count) in &summary.by_domain {
        println!("  {domain:<15} {count}");
    }
    println!("  digest:         {}", summary.digest);
    println!("  members:        {}", summary.members);
    println!("  trusted nodes:  {:?}", summary.trusted_nodes);
    match summary.last_opened_generation {
        Some(generation) => println!("  last opened at secrets generation {generation}"),
        None => println!("  service was never opened"),
    }
    Ok(())
}

pub fn inspect_secrets(path: &Path) -> Result<()> {
    let vault = SecretsVault::read_from_file(path)
        .with_context(|| format!("reading secrets {}", path.display()))?;

    println!("Sealed secrets {}", path.display());
    if vault.is_empty() {
        println!("  no generations");
    }
    for bundle in vault.bundles() {
        println!(
            "  generation {:>3}  {} sealed bytes",
            bundle.generation,
            bundle.sealed_blob.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_testkit::{crash, fresh_cluster, Txs};

    #[tokio::test]
    async fn summary_reflects_the_exported_service() {
        let cluster = fresh_cluster(2, 3).await.unwrap();
        Txs::new().issue(&cluster, 2, 3).await.unwrap();
        let crashed = crash(cluster).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.bin");
        crashed.ledger.write_to_file(&path).unwrap();
        inspect_ledger(&path, true).unwrap();

        let summary = summarize_ledger(&crashed.ledger).unwrap();
        assert_eq!(summary.private, 3);
        assert_eq!(summary.by_domain["application"], 5);
        assert_eq!(summary.by_domain["nodes"], 2);
        assert_eq!(summary.members, 3);
        assert_eq!(summary.trusted_nodes, vec![0, 1]);
        assert_eq!(summary.last_opened_generation, Some(1));
        assert_eq!(summary.next_node_id, 2);
    }

    #[test]
    fn gapped_ledger_is_refused() {
        let snapshot = LedgerSnapshot::new(vec![
            tessera_ledger::TransactionRecord::public(1, b"a".to_vec()),
            tessera_ledger::TransactionRecord::public(3, b"c".to_vec()),
        ]);
        assert!(summarize_ledger(&snapshot).is_err());
    }
}
