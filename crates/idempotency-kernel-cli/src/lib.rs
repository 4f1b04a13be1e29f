//! Operator command surface (`ik`) over the durable dedup store.
//!
//! Every command prints one pretty JSON document on stdout; diagnostics go to
//! stderr through `tracing`.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use idempotency_kernel_core::{
    format_rfc3339, now_utc, CanonicalBody, Fingerprint, HttpMethod, Record, RetentionPolicy,
    UpdateMemberProfileRequest, META_BODY_HASH,
};
use idempotency_kernel_store_sqlite::SqliteDedupStore;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "ik")]
#[command(about = "Idempotency Kernel CLI")]
pub struct Cli {
    #[arg(long, env = "IK_DB", default_value = "./idempotency_kernel.sqlite3")]
    db: PathBuf,

    /// Tenant scope of every record read or written.
    #[arg(long, env = "IK_ISSUER", default_value = "local")]
    issuer: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Creates or upgrades the schema.
    Migrate,
    /// Prints the canonical form and digest of a member profile patch body.
    Canonicalize(CanonicalizeArgs),
    /// Looks up one stored record by fingerprint.
    Lookup(LookupArgs),
    /// Deletes records older than the retention window.
    Purge(PurgeArgs),
    /// Counts stored records.
    Stats,
}

#[derive(Debug, Args)]
pub struct CanonicalizeArgs {
    #[arg(long)]
    body: String,
}

#[derive(Debug, Args)]
pub struct LookupArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    caller: String,
    #[arg(long, value_parser = parse_method)]
    method: HttpMethod,
    #[arg(long)]
    route: String,
    /// Omit to read the meta record of the retry group.
    #[arg(long)]
    body_hash: Option<String>,
}

#[derive(Debug, Args)]
pub struct PurgeArgs {
    #[arg(long)]
    max_age_hours: u64,
}

#[derive(Debug, Serialize)]
struct RecordView {
    kind: &'static str,
    status_code: u16,
    content_type: String,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    accepted_body_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    body_bytes: usize,
}

impl RecordView {
    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            kind: if record.is_meta() { "meta" } else { "response" },
            status_code: record.status_code,
            content_type: record.content_type.clone(),
            created_at: format_rfc3339(record.created_at).map_err(|err| anyhow!(err.to_string()))?,
            accepted_body_hash: record.accepted_body_hash().map(str::to_string),
            body: if record.is_meta() {
                None
            } else {
                String::from_utf8(record.body.clone()).ok()
            },
            body_bytes: record.body.len(),
        })
    }
}

fn parse_method(raw: &str) -> std::result::Result<HttpMethod, String> {
    HttpMethod::parse(raw).ok_or_else(|| {
        format!("unsupported method `{raw}` (expected POST, PUT, PATCH, or DELETE)")
    })
}

/// Executes a parsed command and prints its JSON result.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = execute(&cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes a parsed command and returns the JSON it would print.
///
/// # Errors
/// See [`run_cli`].
pub fn execute(cli: &Cli) -> Result<Value> {
    match &cli.command {
        Command::Canonicalize(args) => canonicalize(args),
        Command::Migrate => {
            let store = open_store(cli)?;
            Ok(json!({
                "issuer": store.issuer(),
                "schema_versions": store.schema_versions()?,
            }))
        }
        Command::Lookup(args) => lookup(args, &open_store(cli)?),
        Command::Purge(args) => purge(args, cli),
        Command::Stats => Ok(serde_json::to_value(open_store(cli)?.stats()?)?),
    }
}

fn open_store(cli: &Cli) -> Result<SqliteDedupStore> {
    tracing::debug!(db = %cli.db.display(), issuer = %cli.issuer, "opening dedup store");
    let store = SqliteDedupStore::open(&cli.db, &cli.issuer)?;
    store.migrate()?;
    Ok(store)
}

fn purge(args: &PurgeArgs, cli: &Cli) -> Result<Value> {
    let policy =
        RetentionPolicy::from_hours(args.max_age_hours).map_err(|err| anyhow!(err.to_string()))?;
    let store = open_store(cli)?;
    let cutoff = policy.cutoff(now_utc());
    let purged = store.purge_created_before(cutoff)?;
    Ok(json!({
        "issuer": store.issuer(),
        "cutoff": format_rfc3339(cutoff).map_err(|err| anyhow!(err.to_string()))?,
        "purged": purged,
    }))
}

fn canonicalize(args: &CanonicalizeArgs) -> Result<Value> {
    let request = UpdateMemberProfileRequest::from_json_slice(args.body.as_bytes())
        .map_err(|err| anyhow!("{}: {err}", err.code()))?;
    let canonical = CanonicalBody::of(&request).map_err(|err| anyhow!(err.to_string()))?;
    let canonical_json =
        String::from_utf8(canonical.bytes).context("canonical body is not valid UTF-8")?;

    Ok(json!({
        "canonical": canonical_json,
        "body_hash": canonical.hash.as_str(),
    }))
}

fn lookup(args: &LookupArgs, store: &SqliteDedupStore) -> Result<Value> {
    let fingerprint = Fingerprint {
        idempotency_key: args.key.clone(),
        caller: args.caller.clone(),
        method: args.method,
        route: args.route.clone(),
        body_hash: args
            .body_hash
            .clone()
            .unwrap_or_else(|| META_BODY_HASH.to_string()),
    };

    match store.find(&fingerprint)? {
        Some(record) => Ok(json!({
            "found": true,
            "fingerprint": fingerprint,
            "record": RecordView::from_record(&record)?,
        })),
        None => Ok(json!({
            "found": false,
            "fingerprint": fingerprint,
        })),
    }
}
