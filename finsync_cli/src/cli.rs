use clap::{Parser, Subcommand};
use finsync_core::{InvestmentType, UserId};

#[derive(Debug, Parser)]
#[command(name = "finsync", version, about = "finsync credential vault and sync tooling")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print a fresh 256-bit master key as hex, for FINSYNC_MASTER_KEY.
    GenerateKey,

    /// Show stored credential state without decrypting anything.
    CredentialStatus {
        #[arg(long)]
        user_id: UserId,

        /// Limit to one service (else every stored service).
        #[arg(long)]
        service: Option<String>,
    },

    /// Re-encrypt credentials written under an old key or past the rotation interval.
    RotateCredentials {
        #[arg(long)]
        user_id: UserId,
    },

    /// Clear an account lock and the failed-attempt window for a service.
    Unlock {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        service: String,
    },

    /// Aggregated sync status per investment type.
    SyncStatus {
        #[arg(long)]
        user_id: UserId,

        /// One type (mutual_fund, fixed_deposit, provident_fund, stock, sip); default all.
        #[arg(long)]
        investment_type: Option<InvestmentType>,
    },

    /// Turn scheduled sync on for an investment type.
    EnableSync {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        investment_type: InvestmentType,
        #[arg(long)]
        preferred_source: Option<String>,
        #[arg(long)]
        fallback_source: Option<String>,
    },

    /// Turn sync off for an investment type.
    DisableSync {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        investment_type: InvestmentType,
        #[arg(long, default_value = "disabled by operator")]
        reason: String,
    },
}
