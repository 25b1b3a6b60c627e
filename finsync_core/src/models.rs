use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("unknown investment type: {0}")]
    UnknownInvestmentType(String),
}

/// Owner of credentials, configurations and investment records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for UserId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Investment categories that can be synchronized from external sources.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentType {
    MutualFund,
    FixedDeposit,
    ProvidentFund,
    Stock,
    Sip,
}

impl InvestmentType {
    pub const ALL: [InvestmentType; 5] = [
        InvestmentType::MutualFund,
        InvestmentType::FixedDeposit,
        InvestmentType::ProvidentFund,
        InvestmentType::Stock,
        InvestmentType::Sip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentType::MutualFund => "mutual_fund",
            InvestmentType::FixedDeposit => "fixed_deposit",
            InvestmentType::ProvidentFund => "provident_fund",
            InvestmentType::Stock => "stock",
            InvestmentType::Sip => "sip",
        }
    }
}

impl fmt::Display for InvestmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvestmentType {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvestmentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| IdParseError::UnknownInvestmentType(s.to_string()))
    }
}

/// A user's investment as held by the tracker.
///
/// `key` is the identifier shared with external sources (ISIN, UAN, ticker,
/// deposit number). `fields` is the open attribute bag that sync merges into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub investment_type: InvestmentType,
    pub key: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Set when the user edited the record by hand; sync must not overwrite it.
    pub manual_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvestmentRecord {
    #[tracing::instrument(level = "debug", skip(fields))]
    pub fn new(
        user_id: UserId,
        investment_type: InvestmentType,
        key: impl Into<String> + std::fmt::Debug,
        fields: serde_json::Map<String, serde_json::Value>,
        now: Option<DateTime<Utc>>,
    ) -> crate::Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "investment key is empty".to_string(),
            ));
        }
        let now = now.unwrap_or_else(Utc::now);
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            investment_type,
            key,
            fields,
            manual_override: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_manual_override(mut self, manual_override: bool) -> Self {
        self.manual_override = manual_override;
        self
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn investment_type_parses_its_own_display() {
        for t in InvestmentType::ALL {
            assert_eq!(t.to_string().parse::<InvestmentType>().unwrap(), t);
        }
        assert!("bonds".parse::<InvestmentType>().is_err());
    }

    #[test]
    fn record_rejects_blank_key() {
        let err = InvestmentRecord::new(
            UserId::new(),
            InvestmentType::Stock,
            "  ",
            serde_json::Map::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidInput(_)));
    }
}
