use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use clap::Parser;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::Level;
use url::Url;

use crate::attestation::AttestationPolicy;
use crate::chain::{ChainContracts, ChainId, SupportedChains};
use crate::cli::Command;
use crate::domain::{DomainRegistry, DomainRegistryError, cctp_domain};
use crate::job::JobHostConfig;
use crate::metrics::MetricsConfig;
use crate::redeem::RedeemerConfig;

#[derive(Parser, Debug)]
#[command(version, about = "Relays USDC transfers across the token bridge")]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file holding signer keys
    #[clap(long)]
    pub secrets: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    attestation_api: Url,
    guardian_api: Url,
    concurrency: Option<usize>,
    max_attempts: Option<u32>,
    signer_acquire_timeout_secs: Option<u64>,
    attestation_deadline_secs: Option<u64>,
    final_confirmations: Option<u64>,
    metrics: Option<MetricsSection>,
    #[serde(default)]
    chains: Vec<ChainConfig>,
}

/// OTLP metrics export. Absent means metrics stay in-process.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricsSection {
    otlp_endpoint: Url,
    service_name: Option<String>,
    export_interval_secs: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChainConfig {
    id: ChainId,
    /// Token-bridge domain. Defaults to the standard domain of `id`.
    domain: Option<u32>,
    rpc_url: Url,
    message_transmitter: Address,
    relayer: Address,
    circle_integration: Address,
    native_symbol: String,
    attestation_initial_timeout_ms: Option<u64>,
}

/// Signer keys deserialized from the secrets TOML.
#[derive(Deserialize)]
struct Secrets {
    #[serde(default)]
    signers: Vec<SignerSecrets>,
    metrics_api_key: Option<String>,
}

#[derive(Deserialize)]
struct SignerSecrets {
    chain: ChainId,
    keys: Vec<B256>,
}

/// One configured chain, assembled from config and secrets.
#[derive(Clone)]
pub struct ChainCtx {
    pub id: ChainId,
    pub domain: u32,
    pub rpc_url: Url,
    pub contracts: ChainContracts,
    pub attestation_initial_timeout: Option<Duration>,
    pub signer_keys: Vec<B256>,
}

impl std::fmt::Debug for ChainCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCtx")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("rpc_url", &self.rpc_url.as_str())
            .field("contracts", &self.contracts)
            .field("signers", &self.signer_keys.len())
            .finish_non_exhaustive()
    }
}

/// Combined runtime context assembled from plaintext config and secrets.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) attestation_api: Url,
    pub(crate) guardian_api: Url,
    pub(crate) concurrency: usize,
    pub(crate) max_attempts: u32,
    pub(crate) signer_acquire_timeout: Duration,
    pub(crate) attestation_deadline: Duration,
    pub(crate) final_confirmations: u64,
    pub metrics: Option<MetricsConfig>,
    pub(crate) chains: Vec<ChainCtx>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        (*log_level).into()
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL lets the status command read while the relayer writes. Writers
    // still serialize, so a blocked write waits up to the busy timeout.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("chain {0} configured more than once")]
    DuplicateChain(ChainId),
    #[error("chain {0} has no standard token-bridge domain; set `domain`")]
    UnknownDomain(ChainId),
    #[error(transparent)]
    Domains(#[from] DomainRegistryError),
    #[error("no signer keys for chain {0}")]
    MissingSigners(ChainId),
    #[error("signer keys given for unconfigured chain {0}")]
    UnknownSignerChain(ChainId),
    #[error("no chains configured")]
    NoChains,
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
}

#[cfg(test)]
impl ConfigError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "failed to read config file",
            Self::Toml(_) => "failed to parse TOML",
            Self::DuplicateChain(_) => "duplicate chain",
            Self::UnknownDomain(_) => "unknown domain",
            Self::Domains(_) => "domain registry error",
            Self::MissingSigners(_) => "missing signers",
            Self::UnknownSignerChain(_) => "unknown signer chain",
            Self::NoChains => "no chains",
            Self::Zero { .. } => "zero value",
        }
    }
}

impl Ctx {
    pub fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        let secrets_str = std::fs::read_to_string(secrets)?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        if config.chains.is_empty() {
            return Err(ConfigError::NoChains);
        }

        let chains = assemble_chains(config.chains, secrets.signers)?;

        let concurrency = config.concurrency.unwrap_or(3);
        if concurrency == 0 {
            return Err(ConfigError::Zero {
                field: "concurrency",
            });
        }

        let max_attempts = config.max_attempts.unwrap_or(5);
        if max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }

        let ctx = Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or_default(),
            attestation_api: config.attestation_api,
            guardian_api: config.guardian_api,
            concurrency,
            max_attempts,
            signer_acquire_timeout: Duration::from_secs(
                config.signer_acquire_timeout_secs.unwrap_or(30),
            ),
            attestation_deadline: Duration::from_secs(
                config.attestation_deadline_secs.unwrap_or(30 * 60),
            ),
            final_confirmations: config.final_confirmations.unwrap_or(1).max(1),
            metrics: config.metrics.map(|metrics| MetricsConfig {
                endpoint: metrics.otlp_endpoint,
                service_name: metrics
                    .service_name
                    .unwrap_or_else(|| "cctp-relayer".to_owned()),
                export_interval: Duration::from_secs(metrics.export_interval_secs.unwrap_or(30)),
                api_key: secrets.metrics_api_key,
            }),
            chains,
        };

        ctx.domain_registry()?;

        Ok(ctx)
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub(crate) fn supported_chains(&self) -> SupportedChains {
        SupportedChains::new(
            self.chains
                .iter()
                .map(|chain| (chain.id, chain.contracts.clone())),
        )
    }

    pub(crate) fn domain_registry(&self) -> Result<DomainRegistry, DomainRegistryError> {
        DomainRegistry::new(self.chains.iter().map(|chain| (chain.domain, chain.id)))
    }

    pub(crate) fn attestation_policy(&self) -> AttestationPolicy {
        let mut policy = AttestationPolicy::default();
        for chain in &self.chains {
            if let Some(timeout) = chain.attestation_initial_timeout {
                policy.initial_timeouts.insert(chain.id, timeout);
            }
        }
        policy
    }

    pub(crate) fn job_host_config(&self) -> JobHostConfig {
        JobHostConfig {
            concurrency: self.concurrency,
            max_attempts: self.max_attempts,
            ..JobHostConfig::default()
        }
    }

    pub(crate) const fn redeemer_config(&self) -> RedeemerConfig {
        RedeemerConfig {
            signer_timeout: self.signer_acquire_timeout,
            attestation_deadline: self.attestation_deadline,
            final_confirmations: self.final_confirmations,
        }
    }
}

fn assemble_chains(
    configs: Vec<ChainConfig>,
    signers: Vec<SignerSecrets>,
) -> Result<Vec<ChainCtx>, ConfigError> {
    let mut keys: HashMap<ChainId, Vec<B256>> = HashMap::new();
    for signer in signers {
        keys.entry(signer.chain).or_default().extend(signer.keys);
    }

    let mut seen = HashSet::new();
    let mut chains = Vec::with_capacity(configs.len());

    for config in configs {
        if !seen.insert(config.id) {
            return Err(ConfigError::DuplicateChain(config.id));
        }

        let domain = config
            .domain
            .or_else(|| cctp_domain(config.id))
            .ok_or(ConfigError::UnknownDomain(config.id))?;

        let signer_keys = keys
            .remove(&config.id)
            .filter(|keys| !keys.is_empty())
            .ok_or(ConfigError::MissingSigners(config.id))?;

        chains.push(ChainCtx {
            id: config.id,
            domain,
            rpc_url: config.rpc_url,
            contracts: ChainContracts {
                message_transmitter: config.message_transmitter,
                relayer: config.relayer,
                circle_integration: config.circle_integration,
                native_symbol: config.native_symbol,
            },
            attestation_initial_timeout: config
                .attestation_initial_timeout_ms
                .map(Duration::from_millis),
            signer_keys,
        });
    }

    if let Some(&chain) = keys.keys().min() {
        return Err(ConfigError::UnknownSignerChain(chain));
    }

    Ok(chains)
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("cctp_relayer={level},cctp_relayer_evm={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
