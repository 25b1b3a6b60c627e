mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use finsync_core::vault::MasterKey;
use finsync_core::{
    CredentialVault, FinsyncConfig, InvestmentType, LogConfig, SqliteStore, SyncEngine,
};
use std::sync::Arc;

/// Operator output goes to stdout as JSON, so logs stay plain text.
fn cli_log_config() -> LogConfig {
    LogConfig {
        json: false,
        ..LogConfig::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::GenerateKey = cli.command {
        println!("{}", MasterKey::generate().to_hex());
        return Ok(());
    }

    // Before config loading, which may warn about a generated master key.
    finsync_core::o11y::init_global(&cli_log_config())?;
    let cfg = FinsyncConfig::from_env()?;

    let store = Arc::new(SqliteStore::new(&cfg.database_path).await?);
    let vault = Arc::new(CredentialVault::new(
        store.clone(),
        &cfg.vault,
        cfg.lockout.clone(),
    )?);

    match cli.command {
        Commands::GenerateKey => {}
        Commands::CredentialStatus { user_id, service } => {
            let services = match service {
                Some(s) => vec![s],
                None => vault.list_services(user_id).await?,
            };
            for service in services {
                let status = vault.status(user_id, &service).await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }
        Commands::RotateCredentials { user_id } => {
            let rotated = vault.rotate_stale(user_id).await?;
            tracing::info!(%user_id, count = rotated.len(), "rotation complete");
            for service in rotated {
                println!("rotated: {service}");
            }
        }
        Commands::Unlock { user_id, service } => {
            if vault.unlock(user_id, &service).await? {
                println!("unlocked: {service}");
            } else {
                println!("no lock for {service}");
            }
        }
        Commands::SyncStatus {
            user_id,
            investment_type,
        } => {
            let engine = SyncEngine::new(store.clone(), store, vault, cfg.retry.clone())?;
            let types = match investment_type {
                Some(t) => vec![t],
                None => InvestmentType::ALL.to_vec(),
            };
            for t in types {
                let report = engine.status(user_id, t).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Commands::EnableSync {
            user_id,
            investment_type,
            preferred_source,
            fallback_source,
        } => {
            let engine = SyncEngine::new(store.clone(), store, vault, cfg.retry.clone())?;
            let mut config = engine.get_configuration(user_id, investment_type).await?;
            config.enabled = true;
            if preferred_source.is_some() {
                config.preferred_source = preferred_source;
            }
            if fallback_source.is_some() {
                config.fallback_source = fallback_source;
            }
            let saved = engine.set_configuration(config).await?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        Commands::DisableSync {
            user_id,
            investment_type,
            reason,
        } => {
            let engine = SyncEngine::new(store.clone(), store, vault, cfg.retry.clone())?;
            engine
                .disable_sync(user_id, investment_type, &reason)
                .await?;
            println!("disabled: {investment_type}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_does_not_depend_on_loaded_config() {
        let cfg = cli_log_config();
        assert!(!cfg.json);
        assert_eq!(cfg.default_filter, LogConfig::default().default_filter);
    }

    #[test]
    fn parses_operator_commands() {
        let user = finsync_core::UserId::new().to_string();
        let cli = Cli::try_parse_from([
            "finsync",
            "sync-status",
            "--user-id",
            user.as_str(),
            "--investment-type",
            "provident_fund",
        ])
        .unwrap();
        match cli.command {
            Commands::SyncStatus {
                investment_type, ..
            } => assert_eq!(investment_type, Some(InvestmentType::ProvidentFund)),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["finsync", "unlock", "--user-id", "nope", "--service", "x"]).is_err());
    }
}
