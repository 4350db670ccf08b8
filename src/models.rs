//! Data models
//!
//! Accounts are polymorphic: the plaintext-indexable columns (id, name,
//! institution, kind, timestamps, demo flag) live as relational columns,
//! while every type-specific attribute lives in [`AccountPayload`], a closed
//! tagged union serialized to JSON and encrypted before it touches disk.
//! Adding an account type means adding one variant and its details struct,
//! never a schema change.

use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Minimum value delta that counts as an account-value change
pub const VALUE_CHANGE_THRESHOLD: f64 = 0.01;

/// Account type tag (plaintext discriminant column)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    /// Certificate of deposit
    Cd,
    /// Savings account
    Savings,
    /// 401(k) retirement account
    Retirement,
    /// Brokerage/trading account with stock positions
    Trading,
    /// Treasury inflation bonds
    InflationBonds,
    /// Health savings account
    Hsa,
}

impl AccountKind {
    /// Column value for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Cd => "CD",
            AccountKind::Savings => "SAVINGS",
            AccountKind::Retirement => "401K",
            AccountKind::Trading => "TRADING",
            AccountKind::InflationBonds => "I_BONDS",
            AccountKind::Hsa => "HSA",
        }
    }

    /// Parse a column value
    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "CD" => Ok(AccountKind::Cd),
            "SAVINGS" => Ok(AccountKind::Savings),
            "401K" => Ok(AccountKind::Retirement),
            "TRADING" => Ok(AccountKind::Trading),
            "I_BONDS" => Ok(AccountKind::InflationBonds),
            "HSA" => Ok(AccountKind::Hsa),
            other => Err(Error::Validation(format!("Unknown account type: {}", other))),
        }
    }

    /// All supported kinds
    pub fn all() -> &'static [AccountKind] {
        &[
            AccountKind::Cd,
            AccountKind::Savings,
            AccountKind::Retirement,
            AccountKind::Trading,
            AccountKind::InflationBonds,
            AccountKind::Hsa,
        ]
    }
}

/// Per-variant validation and value rules
pub trait AccountDetails {
    /// Check invariants (non-negative balances, required fields)
    fn validate(&self) -> Result<()>;
    /// Current dollar value of the holding
    fn current_value(&self) -> f64;
}

fn require_non_negative(field: &str, value: f64) -> Result<()> {
    if value < 0.0 {
        return Err(Error::Validation(format!("{} cannot be negative", field)));
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Certificate of deposit details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdDetails {
    /// Principal amount deposited
    pub principal: f64,
    /// Annual interest rate (percent)
    pub interest_rate: f64,
    /// Maturity date
    pub maturity_date: NaiveDate,
    /// Current value including accrued interest
    pub current_value: f64,
}

impl AccountDetails for CdDetails {
    fn validate(&self) -> Result<()> {
        if self.principal <= 0.0 {
            return Err(Error::Validation("Principal must be positive".to_string()));
        }
        require_non_negative("Interest rate", self.interest_rate)?;
        require_non_negative("Current value", self.current_value)
    }

    fn current_value(&self) -> f64 {
        self.current_value
    }
}

/// Savings account details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingsDetails {
    /// Current balance
    pub balance: f64,
    /// Annual interest rate (percent)
    pub interest_rate: f64,
}

impl AccountDetails for SavingsDetails {
    fn validate(&self) -> Result<()> {
        require_non_negative("Balance", self.balance)?;
        require_non_negative("Interest rate", self.interest_rate)
    }

    fn current_value(&self) -> f64 {
        self.balance
    }
}

/// 401(k) retirement account details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetirementDetails {
    /// Current balance
    pub balance: f64,
    /// Employer match rate (percent)
    pub employer_match: f64,
    /// Annual contribution limit
    pub contribution_limit: f64,
    /// Employer contributions to date
    pub employer_contribution: f64,
}

impl AccountDetails for RetirementDetails {
    fn validate(&self) -> Result<()> {
        require_non_negative("Balance", self.balance)?;
        require_non_negative("Employer match", self.employer_match)?;
        require_non_negative("Contribution limit", self.contribution_limit)?;
        require_non_negative("Employer contribution", self.employer_contribution)
    }

    fn current_value(&self) -> f64 {
        self.balance
    }
}

/// One stock holding inside a trading account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockPosition {
    /// Position ID
    pub id: String,
    /// Ticker symbol
    pub symbol: String,
    /// Share quantity
    pub shares: f64,
    /// Purchase price per share
    pub purchase_price: f64,
    /// Purchase date
    pub purchase_date: NaiveDate,
    /// Last fetched market price per share
    pub current_price: Option<f64>,
    /// Unix timestamp of the last price fetch
    pub last_price_update: Option<i64>,
}

impl StockPosition {
    /// Current value: shares at the last known price, falling back to cost
    pub fn current_value(&self) -> f64 {
        self.shares * self.current_price.unwrap_or(self.purchase_price)
    }

    /// Check position invariants
    pub fn validate(&self) -> Result<()> {
        require_non_empty("Stock symbol", &self.symbol)?;
        require_non_negative("Shares", self.shares)?;
        require_non_negative("Purchase price", self.purchase_price)?;
        if let Some(price) = self.current_price {
            require_non_negative("Current price", price)?;
        }
        Ok(())
    }
}

/// Trading account details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDetails {
    /// Broker name
    pub broker_name: String,
    /// Uninvested cash balance
    pub cash_balance: f64,
    /// Stock positions owned by this account
    #[serde(default)]
    pub positions: Vec<StockPosition>,
}

impl AccountDetails for TradingDetails {
    fn validate(&self) -> Result<()> {
        require_non_empty("Broker name", &self.broker_name)?;
        require_non_negative("Cash balance", self.cash_balance)?;
        for position in &self.positions {
            position.validate()?;
        }
        Ok(())
    }

    fn current_value(&self) -> f64 {
        let stock_value: f64 = self.positions.iter().map(StockPosition::current_value).sum();
        self.cash_balance + stock_value
    }
}

/// Treasury inflation bond details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflationBondDetails {
    /// Purchase amount
    pub purchase_amount: f64,
    /// Purchase date
    pub purchase_date: NaiveDate,
    /// Current redemption value
    pub current_value: f64,
    /// Fixed rate component (percent)
    pub fixed_rate: f64,
    /// Inflation rate component (percent, may be negative)
    pub inflation_rate: f64,
    /// Final maturity date
    pub maturity_date: NaiveDate,
}

impl AccountDetails for InflationBondDetails {
    fn validate(&self) -> Result<()> {
        if self.purchase_amount <= 0.0 {
            return Err(Error::Validation("Purchase amount must be positive".to_string()));
        }
        require_non_negative("Current value", self.current_value)?;
        require_non_negative("Fixed rate", self.fixed_rate)?;
        if self.maturity_date <= self.purchase_date {
            return Err(Error::Validation(
                "Maturity date must be after purchase date".to_string(),
            ));
        }
        Ok(())
    }

    fn current_value(&self) -> f64 {
        self.current_value
    }
}

/// Health savings account details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HsaDetails {
    /// Cash portion of the balance
    pub cash_balance: f64,
    /// Invested portion of the balance
    pub investment_balance: f64,
    /// Annual contribution limit
    pub annual_contribution_limit: f64,
    /// Contributions made this year
    pub current_year_contributions: f64,
    /// Employer contributions this year
    pub employer_contributions: f64,
}

impl AccountDetails for HsaDetails {
    fn validate(&self) -> Result<()> {
        require_non_negative("Cash balance", self.cash_balance)?;
        require_non_negative("Investment balance", self.investment_balance)?;
        require_non_negative("Annual contribution limit", self.annual_contribution_limit)?;
        require_non_negative("Current year contributions", self.current_year_contributions)?;
        require_non_negative("Employer contributions", self.employer_contributions)
    }

    fn current_value(&self) -> f64 {
        self.cash_balance + self.investment_balance
    }
}

/// Type-specific account payload (the encrypted blob, decrypted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "account_type")]
pub enum AccountPayload {
    /// Certificate of deposit
    #[serde(rename = "CD")]
    Cd(CdDetails),
    /// Savings account
    #[serde(rename = "SAVINGS")]
    Savings(SavingsDetails),
    /// 401(k) retirement account
    #[serde(rename = "401K")]
    Retirement(RetirementDetails),
    /// Trading account
    #[serde(rename = "TRADING")]
    Trading(TradingDetails),
    /// Treasury inflation bonds
    #[serde(rename = "I_BONDS")]
    InflationBonds(InflationBondDetails),
    /// Health savings account
    #[serde(rename = "HSA")]
    Hsa(HsaDetails),
}

impl AccountPayload {
    /// Discriminant for this payload
    pub fn kind(&self) -> AccountKind {
        match self {
            AccountPayload::Cd(_) => AccountKind::Cd,
            AccountPayload::Savings(_) => AccountKind::Savings,
            AccountPayload::Retirement(_) => AccountKind::Retirement,
            AccountPayload::Trading(_) => AccountKind::Trading,
            AccountPayload::InflationBonds(_) => AccountKind::InflationBonds,
            AccountPayload::Hsa(_) => AccountKind::Hsa,
        }
    }

    /// Validate the variant's invariants
    pub fn validate(&self) -> Result<()> {
        match self {
            AccountPayload::Cd(d) => d.validate(),
            AccountPayload::Savings(d) => d.validate(),
            AccountPayload::Retirement(d) => d.validate(),
            AccountPayload::Trading(d) => d.validate(),
            AccountPayload::InflationBonds(d) => d.validate(),
            AccountPayload::Hsa(d) => d.validate(),
        }
    }

    /// Current dollar value of the account
    pub fn current_value(&self) -> f64 {
        match self {
            AccountPayload::Cd(d) => d.current_value(),
            AccountPayload::Savings(d) => d.current_value(),
            AccountPayload::Retirement(d) => d.current_value(),
            AccountPayload::Trading(d) => d.current_value(),
            AccountPayload::InflationBonds(d) => d.current_value(),
            AccountPayload::Hsa(d) => d.current_value(),
        }
    }

    /// Serialize to the plaintext bytes that get encrypted
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from decrypted plaintext bytes, checking the tag against
    /// the row's discriminant column
    pub fn from_bytes(bytes: &[u8], expected: AccountKind) -> Result<Self> {
        let payload: AccountPayload = serde_json::from_slice(bytes)?;
        if payload.kind() != expected {
            return Err(Error::Validation(format!(
                "Payload type {} does not match account type {}",
                payload.kind().as_str(),
                expected.as_str()
            )));
        }
        Ok(payload)
    }
}

/// Full account record (decrypted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account ID (uuid string)
    pub id: String,
    /// Display name
    pub name: String,
    /// Institution name
    pub institution: String,
    /// Account type tag
    pub kind: AccountKind,
    /// Creation unix timestamp
    pub created_at: i64,
    /// Last update unix timestamp
    pub last_updated: i64,
    /// Sample-data flag (eligible for bulk removal)
    pub is_demo: bool,
    /// Payload schema version stamped at write time
    pub schema_version: i32,
    /// Type-specific details
    pub payload: AccountPayload,
}

impl AccountRecord {
    /// Current dollar value of the account
    pub fn current_value(&self) -> f64 {
        self.payload.current_value()
    }
}

/// Input for creating an account
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Caller-supplied ID; a uuid is generated when absent
    pub id: Option<String>,
    /// Display name
    pub name: String,
    /// Institution name
    pub institution: String,
    /// Type-specific details
    pub payload: AccountPayload,
    /// Sample-data flag
    pub is_demo: bool,
}

impl NewAccount {
    /// New real (non-demo) account
    pub fn new(name: impl Into<String>, institution: impl Into<String>, payload: AccountPayload) -> Self {
        Self {
            id: None,
            name: name.into(),
            institution: institution.into(),
            payload,
            is_demo: false,
        }
    }

    /// Mark as demo data
    pub fn demo(mut self) -> Self {
        self.is_demo = true;
        self
    }
}

/// Partial update to an account; `None` fields keep their current value
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    /// New display name
    pub name: Option<String>,
    /// New institution name
    pub institution: Option<String>,
    /// Replacement payload
    pub payload: Option<AccountPayload>,
    /// New demo flag
    pub is_demo: Option<bool>,
}

/// Why a snapshot was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReason {
    /// User edited the account
    ManualUpdate,
    /// A market price refresh moved the value
    PriceRefresh,
    /// First snapshot at account creation
    InitialEntry,
}

impl ChangeReason {
    /// Column value for this reason
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::ManualUpdate => "MANUAL_UPDATE",
            ChangeReason::PriceRefresh => "STOCK_PRICE_UPDATE",
            ChangeReason::InitialEntry => "INITIAL_ENTRY",
        }
    }

    /// Parse a column value
    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "MANUAL_UPDATE" => Ok(ChangeReason::ManualUpdate),
            "STOCK_PRICE_UPDATE" => Ok(ChangeReason::PriceRefresh),
            "INITIAL_ENTRY" => Ok(ChangeReason::InitialEntry),
            other => Err(Error::Validation(format!("Unknown change type: {}", other))),
        }
    }
}

/// Immutable point-in-time account value record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot ID (uuid string)
    pub id: String,
    /// Owning account ID
    pub account_id: String,
    /// Capture unix timestamp
    pub timestamp: i64,
    /// Observed account value
    pub value: f64,
    /// What triggered the snapshot
    pub reason: ChangeReason,
    /// Context captured with the snapshot (account name/kind/institution)
    pub metadata: Option<serde_json::Value>,
}

/// Filter for account listings
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountFilter {
    /// Restrict to one account kind
    pub kind: Option<AccountKind>,
    /// Restrict to demo (`Some(true)`) or real (`Some(false)`) accounts
    pub is_demo: Option<bool>,
}

impl AccountFilter {
    /// Restrict to one kind
    pub fn kind(kind: AccountKind) -> Self {
        Self {
            kind: Some(kind),
            is_demo: None,
        }
    }

    /// Only demo accounts
    pub fn demo_only() -> Self {
        Self {
            kind: None,
            is_demo: Some(true),
        }
    }

    /// Only real accounts
    pub fn real_only() -> Self {
        Self {
            kind: None,
            is_demo: Some(false),
        }
    }
}
