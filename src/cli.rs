//! Operator commands of the `relayer` binary.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use alloy::primitives::{Address, B256, Bytes, TxHash};
use alloy::providers::ProviderBuilder;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cctp_relayer_evm::local::connect_http;
use cctp_relayer_evm::{EvmError, ReadOnlyEvm, Wallet};
use clap::Subcommand;
use futures_util::stream;
use itertools::Itertools;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::attestation::AttestationClient;
use crate::chain::ChainId;
use crate::config::Ctx;
use crate::gateway::EvmGateway;
use crate::guardian::GuardianApi;
use crate::job::{Delivery, Disposition, JobHost};
use crate::redeem::Redeemer;
use crate::relay::{Relay, RelayStatus, SqliteRelayStore};
use crate::signer::SignerPool;
use crate::vaa::{MessageId, SignedMessage, VaaError};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("signed message is neither hex nor base64")]
    Encoding,
    #[error("emitter must be a 20-byte address or a 32-byte word, got {0:?}")]
    Emitter(String),
    #[error("line {line}: expected `<signed message> <source tx hash>`")]
    BatchLine { line: usize },
    #[error(transparent)]
    Vaa(#[from] VaaError),
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deliver one signed message
    Relay {
        /// Signed message bytes, hex or base64
        #[arg(long, value_parser = parse_signed_message)]
        vaa: Bytes,
        /// Source-chain transaction that emitted the message
        #[arg(long)]
        source_tx: TxHash,
    },
    /// Deliver every message in a file, one `<signed message> <source tx>` per line
    Batch {
        #[arg(long)]
        file: PathBuf,
    },
    /// Fetch a message from the guardian API and deliver it again
    Reprocess {
        /// Emitter chain id
        #[arg(long)]
        chain: u16,
        /// Emitter contract, as an address or a left-padded word
        #[arg(long, value_parser = parse_emitter)]
        emitter: B256,
        #[arg(long)]
        sequence: u64,
    },
    /// Print the relay record of a source transaction as JSON
    Status {
        #[arg(long)]
        source_tx: TxHash,
    },
    /// List relay records in one status, newest first
    List {
        #[arg(long, default_value = "failed")]
        status: RelayStatus,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn parse_signed_message(input: &str) -> Result<Bytes, CliError> {
    let input = input.trim();
    let hex = input.strip_prefix("0x").unwrap_or(input);

    if hex.bytes().all(|byte| byte.is_ascii_hexdigit())
        && let Ok(bytes) = alloy::hex::decode(hex)
    {
        return Ok(Bytes::from(bytes));
    }

    STANDARD
        .decode(input)
        .map(Bytes::from)
        .map_err(|_| CliError::Encoding)
}

fn parse_emitter(input: &str) -> Result<B256, CliError> {
    if let Ok(word) = input.parse::<B256>() {
        return Ok(word);
    }

    input
        .parse::<Address>()
        .map(|address| address.into_word())
        .map_err(|_| CliError::Emitter(input.to_owned()))
}

fn parse_batch(contents: &str) -> Result<Vec<Delivery>, CliError> {
    contents
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line, text)| {
            let mut fields = text.split_whitespace();
            let (Some(vaa), Some(source_tx), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(CliError::BatchLine { line });
            };

            let raw = parse_signed_message(vaa)?;
            let source_tx_hash = source_tx
                .parse()
                .map_err(|_| CliError::BatchLine { line })?;

            Ok(Delivery {
                message: SignedMessage::parse(&raw)?,
                source_tx_hash,
            })
        })
        .collect()
}

pub async fn run_command(ctx: Ctx, command: Command) -> anyhow::Result<()> {
    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let mut stdout = std::io::stdout();
    run_command_with_writers(&ctx, command, &pool, &mut stdout).await
}

pub async fn run_command_with_writers<W: Write>(
    ctx: &Ctx,
    command: Command,
    pool: &SqlitePool,
    stdout: &mut W,
) -> anyhow::Result<()> {
    let store = SqliteRelayStore::new(pool.clone());

    match command {
        Command::Relay { vaa, source_tx } => {
            let delivery = Delivery {
                message: SignedMessage::parse(&vaa)?,
                source_tx_hash: source_tx,
            };
            let key = delivery.id();

            let host = build_job_host(ctx, store)?;
            let disposition = host.submit(delivery).await?;
            writeln!(stdout, "{key}: {}", describe(&disposition))?;
        }
        Command::Batch { file } => {
            let deliveries = parse_batch(&std::fs::read_to_string(&file)?)?;
            info!(count = deliveries.len(), file = %file.display(), "Delivering batch");

            let host = build_job_host(ctx, store)?;
            let summary = host.run(stream::iter(deliveries)).await;
            writeln!(
                stdout,
                "completed: {}, skipped: {}, failed: {}, errors: {}",
                summary.completed, summary.skipped, summary.failed, summary.errors
            )?;
        }
        Command::Reprocess {
            chain,
            emitter,
            sequence,
        } => {
            let id = MessageId {
                emitter_chain: ChainId(chain),
                emitter_address: emitter,
                sequence,
            };

            let delivery = GuardianApi::new(ctx.guardian_api.clone()).fetch(id).await?;
            let host = build_job_host(ctx, store)?;
            let disposition = host.reprocess(delivery).await?;
            writeln!(stdout, "{id}: {}", describe(&disposition))?;
        }
        Command::Status { source_tx } => match store.find_by_source_tx(source_tx).await? {
            Some(relay) => writeln!(stdout, "{}", serde_json::to_string_pretty(&relay)?)?,
            None => writeln!(stdout, "No relay found for source transaction {source_tx}")?,
        },
        Command::List { status, limit } => {
            let relays = store.list_by_status(status, limit).await?;
            if relays.is_empty() {
                writeln!(stdout, "No {status} relays")?;
            }
            for relay in &relays {
                writeln!(stdout, "{}", summarize(relay))?;
            }
        }
    }

    Ok(())
}

fn describe(disposition: &Disposition) -> String {
    match disposition {
        Disposition::Unrouted => "no handler for emitter".to_owned(),
        Disposition::Filtered => "filtered, not sent through this relayer".to_owned(),
        Disposition::Completed { attempts } => format!("redeemed after {attempts} attempt(s)"),
        Disposition::Unrecoverable { attempts, reason } => {
            format!("failed on attempt {attempts}: {reason}")
        }
        Disposition::Exhausted { attempts, reason } => {
            format!("failed after {attempts} attempts: {reason}")
        }
    }
}

fn summarize(relay: &Relay) -> String {
    [
        Some(relay.message_id().to_string()),
        Some(relay.status.to_string()),
        Some(format!("attempts={}/{}", relay.attempts, relay.max_attempts)),
        relay.to_tx_hash.map(|tx_hash| format!("to_tx={tx_hash}")),
        relay
            .error_message
            .as_ref()
            .map(|error| format!("error={error:?}")),
    ]
    .into_iter()
    .flatten()
    .join(" ")
}

fn build_signer_pool(ctx: &Ctx) -> Result<SignerPool, EvmError> {
    let mut wallets = Vec::with_capacity(ctx.chains.len());

    for chain in &ctx.chains {
        let chain_wallets = chain
            .signer_keys
            .iter()
            .map(|key| {
                let wallet = connect_http(chain.rpc_url.clone(), key)?;
                info!(chain = %chain.id, address = %wallet.address(), "Loaded signer");
                Ok(Arc::new(wallet) as Arc<dyn Wallet>)
            })
            .collect::<Result<Vec<_>, EvmError>>()?;

        wallets.push((chain.id, chain_wallets));
    }

    Ok(SignerPool::new(wallets))
}

fn build_job_host(ctx: &Ctx, store: SqliteRelayStore) -> anyhow::Result<JobHost> {
    let chains = ctx.supported_chains();

    let evms: HashMap<_, _> = ctx
        .chains
        .iter()
        .map(|chain| {
            let provider = ProviderBuilder::new().connect_http(chain.rpc_url.clone());
            (chain.id, ReadOnlyEvm::new(provider))
        })
        .collect();

    let redeemer = Arc::new(Redeemer::new(
        chains.clone(),
        ctx.domain_registry()?,
        Arc::new(EvmGateway::new(chains.clone(), evms)),
        Arc::new(AttestationClient::new(
            ctx.attestation_api.clone(),
            ctx.attestation_policy(),
        )?),
        build_signer_pool(ctx)?,
        store.clone(),
        ctx.redeemer_config(),
    ));

    let mut host = JobHost::new(store, ctx.job_host_config())?;
    for chain in chains.ids() {
        host.register(chain, chains.emitter(chain)?, redeemer.clone());
    }

    Ok(host)
}
