//! In-process crash/recover simulation.
//!
//! Starts a fresh service, then for every cycle issues a batch of public and
//! private transactions, crashes the cluster and recovers it onto new nodes,
//! checking every transaction issued so far after each recovery.

use anyhow::{ensure, Context, Result};
use clap::Args;
use std::path::PathBuf;
use tessera_core::RecoveryConfig;
use tessera_testkit::RecoveryScenario;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Nodes started by the service and by every recovery
    #[arg(short = 'n', long, default_value = "2")]
    pub nodes: usize,

    /// Governance members
    #[arg(short = 'm', long, default_value = "3")]
    pub members: usize,

    /// Crash/recover cycles
    #[arg(short = 'r', long, default_value = "3")]
    pub recoveries: usize,

    /// Transactions issued before each crash, split between public and private
    #[arg(short = 'k', long, default_value = "10")]
    pub msgs_per_recovery: usize,

    /// Rotate the ledger secrets before every crash
    #[arg(long)]
    pub rotate: bool,

    /// Directory for the final ledger, secrets and history files
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

pub async fn run(args: SimulateArgs, config: RecoveryConfig) -> Result<()> {
    ensure!(args.nodes > 0, "--nodes must be at least 1");
    ensure!(args.members > 0, "--members must be at least 1");

    let mut scenario = RecoveryScenario::start_with_config(args.nodes, args.members, config)
        .await
        .context("starting service")?;
    let public = args.msgs_per_recovery / 2;
    let private = args.msgs_per_recovery - public;

    for cycle in 1..=args.recoveries {
        scenario.issue(public, private).await?;
        if args.rotate {
            let generation = scenario.cluster_mut()?.rotate_ledger_secrets().await?;
            tracing::info!(cycle, generation, "rotated before crash");
        }
        scenario
            .crash_and_recover()
            .await
            .with_context(|| format!("recovery {cycle}"))?;
        scenario
            .verify()
            .await
            .with_context(|| format!("verification after recovery {cycle}"))?;

        let status = scenario.cluster()?.status();
        println!(
            "recovery {cycle}: {} transactions verified, committed index {}, nodes {:?}",
            scenario.txs().len(),
            status.committed_index,
            status.nodes.keys().map(|n| n.value()).collect::<Vec<_>>()
        );
    }

    let history = scenario.history().clone();
    let crashed = scenario.crash()?;
    println!(
        "{} recoveries completed, {} ledger records, {} secrets generations",
        history.len(),
        crashed.ledger.len(),
        crashed.vault.len()
    );

    if let Some(out) = args.out {
        std::fs::create_dir_all(&out)
            .with_context(|| format!("creating {}", out.display()))?;
        crashed.ledger.write_to_file(&out.join("ledger.bin"))?;
        crashed.vault.write_to_file(&out.join("secrets.json"))?;
        history.save(&out.join("history.json"))?;
        println!("wrote ledger.bin, secrets.json and history.json to {}", out.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_ledger::{LedgerSnapshot, SecretsVault};
    use tessera_recovery::RecoveryHistory;

    #[tokio::test]
    async fn simulation_writes_recoverable_files() {
        let dir = tempfile::tempdir().unwrap();
        let args = SimulateArgs {
            nodes: 2,
            members: 3,
            recoveries: 2,
            msgs_per_recovery: 4,
            rotate: true,
            out: Some(dir.path().to_path_buf()),
        };
        let config = RecoveryConfig {
            replay_yield_interval: 4,
            ..RecoveryConfig::default()
        };
        run(args, config).await.unwrap();

        let ledger = LedgerSnapshot::read_from_file(&dir.path().join("ledger.bin")).unwrap();
        ledger.validate().unwrap();
        let vault = SecretsVault::read_from_file(&dir.path().join("secrets.json")).unwrap();
        assert_eq!(vault.latest().map(|b| b.generation), Some(3));
        let history = RecoveryHistory::load(&dir.path().join("history.json")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.attempts()[1].visible.len(), 8);
    }
}
