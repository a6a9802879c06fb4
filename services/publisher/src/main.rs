//! Publisher Service - Syncs transparency datasets into the open-data catalog
//!
//! Responsibilities:
//! - Fetch yearly exports from the municipal transparency API
//! - Aggregate the monthly personnel-expense export into one file per year
//! - Stage responses as CSV files under a per-run directory
//! - Anonymize sensitive columns where an endpoint requires it
//! - Create CKAN packages/resources on first sight, patch resources after
//!
//! Usage:
//!   # Full registry:
//!   cargo run --bin publisher -- --config config/endpoints.json
//!
//!   # Single endpoint:
//!   cargo run --bin publisher -- --config config/endpoints.json --endpoint servidor
//!
//!   # Fetch and transform only, no catalog calls:
//!   cargo run --bin publisher -- --config config/endpoints.json --dry-run

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use clap::Parser;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "publisher", about = "Publishes transparency datasets to the open-data catalog")]
struct Args {
    /// Path to the endpoint registry file
    #[arg(long, default_value = "config/endpoints.json")]
    config: String,

    /// Only process the endpoint with this slug
    #[arg(long)]
    endpoint: Option<String>,

    /// Fetch and transform but skip all catalog calls
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Endpoint Registry Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Registry {
    version: String,
    organizations: Vec<Organization>,
}

#[derive(Debug, Deserialize)]
struct Organization {
    name: String,
    owner_org: String,
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    name: String,
    slug: String,
    #[serde(default)]
    notes: String,
    url: String,
    /// Filename template with a {year} placeholder, e.g. "servidor-{year}.csv"
    filename: String,
    #[serde(default)]
    response: ResponseShape,
    /// Static source request headers (tenant id, entity id)
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Reporting years to process, in order
    periods: Vec<i32>,
}

/// How the source API wraps the export for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum ResponseShape {
    /// Envelope carries a "data" list of row objects
    #[default]
    JsonRows,
    /// Envelope carries a "path" field holding the base64-encoded file body
    Base64File,
}

/// The personnel-expense export only answers one month at a time, so its
/// years are assembled from twelve monthly sub-requests.
const PERSONNEL_EXPENSE_SLUG: &str = "gasto_com_pessoal";

/// Source header carrying the reporting year ("exercício").
const YEAR_HEADER: &str = "exercicio";

/// Source header carrying the month for the monthly export.
const MONTH_HEADER: &str = "mesano";

#[derive(Debug, Clone)]
struct Config {
    catalog_url: String,
    api_token: String,
    staging_root: PathBuf,
    http_timeout_secs: u64,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            catalog_url: std::env::var("CKAN_API_URL").context("CKAN_API_URL env var missing")?,
            api_token: std::env::var("CKAN_API_KEY").context("CKAN_API_KEY env var missing")?,
            staging_root: std::env::var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .unwrap_or(120),
        })
    }
}

/// Load the endpoint registry from a JSON file
async fn load_registry(path: &str) -> Result<Registry> {
    let content = fs::read_to_string(path)
        .await
        .context("Failed to read endpoint registry")?;
    let registry: Registry =
        serde_json::from_str(&content).context("Failed to parse endpoint registry")?;
    Ok(registry)
}

// =============================================================================
// Normalization Helpers
// =============================================================================

/// ASCII-fold the accented characters that occur in Portuguese dataset names.
fn strip_accents(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'ç' => 'c',
            'Ç' => 'C',
            _ => c,
        })
        .collect()
}

/// Derive the catalog resource name for one (endpoint, year): display name
/// and year joined, accents stripped, spaces replaced by underscores.
fn resource_key(display_name: &str, year: i32) -> String {
    strip_accents(&format!("{} {}", display_name, year)).replace(' ', "_")
}

/// Substitute the reporting year into an endpoint's filename template
fn staged_filename(template: &str, year: i32) -> String {
    template.replace("{year}", &year.to_string())
}

// =============================================================================
// Data Fetcher
// =============================================================================

/// Build the source request headers for one reporting period. Headers are
/// constructed fresh per call; the endpoint descriptor is never mutated.
fn period_headers(endpoint: &Endpoint, year: i32, month: Option<u32>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in &endpoint.headers {
        headers.insert(
            HeaderName::from_bytes(key.as_bytes()).context("Invalid header name in registry")?,
            HeaderValue::from_str(value).context("Invalid header value in registry")?,
        );
    }
    headers.insert(YEAR_HEADER, HeaderValue::from_str(&year.to_string())?);
    if let Some(month) = month {
        headers.insert(MONTH_HEADER, HeaderValue::from_str(&month.to_string())?);
    }
    Ok(headers)
}

/// Extract the row list from a json_rows envelope. A missing "data" field
/// means the period has no export, which is not an error.
fn parse_envelope(body: &str) -> Result<Option<Vec<Value>>> {
    let envelope: Value = serde_json::from_str(body).context("Source response is not valid JSON")?;
    match envelope.get("data") {
        Some(Value::Array(rows)) => Ok(Some(rows.clone())),
        Some(_) => anyhow::bail!("Source response 'data' field is not a list"),
        None => Ok(None),
    }
}

/// Extract and decode the file body from a base64_file envelope.
fn decode_export(body: &str) -> Result<Option<Vec<u8>>> {
    let envelope: Value = serde_json::from_str(body).context("Source response is not valid JSON")?;
    match envelope.get("path") {
        Some(Value::String(encoded)) => {
            let bytes = BASE64
                .decode(encoded)
                .context("Source response 'path' field is not valid base64")?;
            Ok(Some(bytes))
        }
        Some(_) => anyhow::bail!("Source response 'path' field is not a string"),
        None => Ok(None),
    }
}

/// Concatenate monthly payloads in month order. Empty months contribute
/// nothing; the caller decides what an entirely empty year means.
fn merge_month_rows(months: Vec<Option<Vec<Value>>>) -> Vec<Value> {
    months.into_iter().flatten().flatten().collect()
}

/// Render cell text for CSV staging. Carriage-return/newline sequences
/// inside values are stripped, matching the published exports.
fn cell_text(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    text.replace("\r\n", "").replace(['\r', '\n'], "")
}

/// Convert a list of row objects into CSV bytes. Columns are the union of
/// row keys in first-seen order; rows missing a column get an empty cell.
fn rows_to_csv(rows: &[Value]) -> Result<Vec<u8>> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(fields) = row {
            for key in fields.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
    }

    if columns.is_empty() {
        return Ok(Vec::new());
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns)?;
    for row in rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| {
                row.get(column)
                    .map(cell_text)
                    .unwrap_or_default()
            })
            .collect();
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush staged CSV: {}", e))
}

/// Fetch one reporting year for an endpoint into a staged file.
///
/// Returns Ok(None) when the source has no export for that period. The
/// staged file is written in a single call: either the full table lands on
/// disk or nothing does.
async fn fetch_period(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    year: i32,
    staging_dir: &Path,
) -> Result<Option<PathBuf>> {
    let path = staging_dir.join(staged_filename(&endpoint.filename, year));

    let bytes = if endpoint.slug == PERSONNEL_EXPENSE_SLUG {
        let mut monthly: Vec<Option<Vec<Value>>> = Vec::with_capacity(12);
        for month in 1..=12 {
            let headers = period_headers(endpoint, year, Some(month))?;
            let body = client
                .get(&endpoint.url)
                .headers(headers)
                .send()
                .await?
                .error_for_status()
                .context("Source request failed")?
                .text()
                .await?;
            match parse_envelope(&body)? {
                Some(rows) if !rows.is_empty() => monthly.push(Some(rows)),
                _ => {
                    println!("  ⚠ No data for {}/{}", year, month);
                    monthly.push(None);
                }
            }
        }
        let rows = merge_month_rows(monthly);
        if rows.is_empty() {
            return Ok(None);
        }
        rows_to_csv(&rows)?
    } else {
        let headers = period_headers(endpoint, year, None)?;
        let body = client
            .get(&endpoint.url)
            .headers(headers)
            .send()
            .await?
            .error_for_status()
            .context("Source request failed")?
            .text()
            .await?;
        match endpoint.response {
            ResponseShape::JsonRows => match parse_envelope(&body)? {
                Some(rows) => rows_to_csv(&rows)?,
                None => return Ok(None),
            },
            ResponseShape::Base64File => match decode_export(&body)? {
                Some(bytes) => bytes,
                None => return Ok(None),
            },
        }
    };

    fs::write(&path, bytes)
        .await
        .context("Failed to write staged file")?;
    Ok(Some(path))
}

// =============================================================================
// Transform Stage
// =============================================================================

/// Per-endpoint rewrite applied to a staged file before upload. Transforms
/// are keyed by endpoint slug, not stored in the registry file.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Transform {
    None,
    AnonymizeServidor,
}

impl Transform {
    fn for_endpoint(slug: &str) -> Transform {
        match slug {
            "servidor" => Transform::AnonymizeServidor,
            _ => Transform::None,
        }
    }

    async fn apply(&self, path: &Path) -> Result<()> {
        match self {
            Transform::None => Ok(()),
            Transform::AnonymizeServidor => {
                let content = fs::read_to_string(path)
                    .await
                    .context("Failed to read staged file for anonymization")?;
                let cleaned = anonymize_servidor(&content)?;
                fs::write(path, cleaned)
                    .await
                    .context("Failed to write anonymized file")?;
                Ok(())
            }
        }
    }
}

fn hash_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Anonymize the servidor export: drop the raw-name column, replace the
/// registration number with a one-way hash, and keep only the component
/// after the last "/" of the birth date. Columns already absent are
/// skipped, so re-running on a transformed file is harmless.
fn anonymize_servidor(content: &str) -> Result<String> {
    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let headers = reader
        .headers()
        .context("Failed to read staged CSV headers")?
        .clone();

    let name_col = headers.iter().position(|h| h == "nome_servidor");
    let registration_col = headers.iter().position(|h| h == "numero_matricula");
    let birth_date_col = headers.iter().position(|h| h == "data_nascimento");

    let kept: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != name_col)
        .map(|(_, h)| h.to_string())
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&kept)?;

    for record in reader.records() {
        let record = record.context("Failed to read staged CSV record")?;
        let mut row: Vec<String> = Vec::with_capacity(kept.len());
        for (i, field) in record.iter().enumerate() {
            if Some(i) == name_col {
                continue;
            }
            if Some(i) == registration_col {
                row.push(hash_value(field));
            } else if Some(i) == birth_date_col {
                row.push(field.rsplit('/').next().unwrap_or("").to_string());
            } else {
                row.push(field.to_string());
            }
        }
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush anonymized CSV: {}", e))?;
    String::from_utf8(bytes).context("Anonymized CSV is not valid UTF-8")
}

// =============================================================================
// Catalog Reconciler
// =============================================================================

#[derive(Debug, Deserialize)]
struct ActionResponse<T> {
    success: bool,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PackageResult {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResourceResult {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResourceSearchResult {
    #[serde(default)]
    results: Vec<ResourceResult>,
}

/// Look up a package by slug. A failed lookup (including 404) means the
/// package does not exist yet.
async fn find_package(
    client: &reqwest::Client,
    config: &Config,
    slug: &str,
) -> Result<Option<String>> {
    let url = format!("{}/api/3/action/package_show?id={}", config.catalog_url, slug);
    let resp = client.get(&url).send().await?;
    let parsed: ActionResponse<PackageResult> = resp
        .json()
        .await
        .context("package_show returned invalid JSON")?;
    if parsed.success {
        Ok(parsed.result.map(|r| r.id))
    } else {
        Ok(None)
    }
}

async fn create_package(
    client: &reqwest::Client,
    config: &Config,
    owner_org: &str,
    endpoint: &Endpoint,
) -> Result<String> {
    let request = serde_json::json!({
        "owner_org": owner_org,
        "name": strip_accents(&endpoint.slug),
        "title": endpoint.name,
        "notes": endpoint.notes,
    });

    let resp = client
        .post(format!("{}/api/action/package_create", config.catalog_url))
        .header(AUTHORIZATION, config.api_token.as_str())
        .json(&request)
        .send()
        .await?;
    let status = resp.status();
    let parsed: ActionResponse<PackageResult> = resp
        .json()
        .await
        .context("package_create returned invalid JSON")?;

    if !parsed.success {
        anyhow::bail!("package_create for '{}' rejected (HTTP {})", endpoint.slug, status);
    }
    parsed
        .result
        .map(|r| r.id)
        .context("package_create response missing result id")
}

/// Resolve the catalog package for an endpoint, creating it on first
/// sight. Existing packages are returned untouched: title and notes are
/// only set on creation.
async fn ensure_package(
    client: &reqwest::Client,
    config: &Config,
    owner_org: &str,
    endpoint: &Endpoint,
) -> Result<String> {
    if let Some(id) = find_package(client, config, &endpoint.slug).await? {
        println!("  Package exists: {}", id);
        return Ok(id);
    }
    let id = create_package(client, config, owner_org, endpoint).await?;
    println!("  Package created: {}", id);
    Ok(id)
}

/// Look up a resource by its derived name. The first hit wins.
async fn find_resource(
    client: &reqwest::Client,
    config: &Config,
    key: &str,
) -> Result<Option<String>> {
    let url = format!(
        "{}/api/3/action/resource_search?query=name:{}",
        config.catalog_url, key
    );
    let resp = client.get(&url).send().await?;
    let parsed: ActionResponse<ResourceSearchResult> = resp
        .json()
        .await
        .context("resource_search returned invalid JSON")?;
    match parsed.result {
        Some(found) if parsed.success => Ok(found.results.into_iter().next().map(|r| r.id)),
        _ => Ok(None),
    }
}

/// Create or patch the catalog resource for one staged file. Exactly one
/// upload request is made either way; an existing resource keeps its id.
async fn ensure_resource(
    client: &reqwest::Client,
    config: &Config,
    key: &str,
    package_id: &str,
    staged: &Path,
) -> Result<String> {
    let bytes = fs::read(staged).await.context("Failed to read staged file")?;
    let filename = staged
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| key.to_string());
    let upload = Part::bytes(bytes).file_name(filename);

    let (url, form) = match find_resource(client, config, key).await? {
        Some(resource_id) => (
            format!("{}/api/action/resource_patch", config.catalog_url),
            Form::new().text("id", resource_id),
        ),
        None => (
            format!("{}/api/action/resource_create", config.catalog_url),
            Form::new()
                .text("package_id", package_id.to_string())
                .text("name", key.to_string())
                .text("title", key.to_string()),
        ),
    };

    let resp = client
        .post(&url)
        .header(AUTHORIZATION, config.api_token.as_str())
        .multipart(form.part("upload", upload))
        .send()
        .await?;
    let status = resp.status();
    let parsed: ActionResponse<ResourceResult> = resp
        .json()
        .await
        .context("Catalog upload returned invalid JSON")?;

    if !parsed.success {
        anyhow::bail!("Catalog rejected upload for '{}' (HTTP {})", key, status);
    }
    parsed
        .result
        .map(|r| r.id)
        .context("Upload response missing resource id")
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Process one (endpoint, year) unit: fetch, transform, publish, clean up.
/// Returns Ok(None) when the source has no export for the period.
async fn process_year(
    client: &reqwest::Client,
    config: &Config,
    endpoint: &Endpoint,
    transform: Transform,
    package_id: &str,
    staging_dir: &Path,
    year: i32,
    dry_run: bool,
) -> Result<Option<String>> {
    let staged = match fetch_period(client, endpoint, year, staging_dir).await? {
        Some(path) => path,
        None => return Ok(None),
    };

    transform.apply(&staged).await?;

    let key = resource_key(&endpoint.name, year);
    if dry_run {
        println!("  Dry run - would publish {} from {}", key, staged.display());
        return Ok(Some("(dry-run)".to_string()));
    }

    let resource_id = ensure_resource(client, config, &key, package_id, &staged).await?;
    fs::remove_file(&staged).await.ok();
    Ok(Some(resource_id))
}

/// Print summary of configured endpoints
fn print_registry_summary(registry: &Registry) {
    println!("\nConfigured endpoints:");
    println!("{:-<60}", "");
    for organization in &registry.organizations {
        println!("  {} ({})", organization.name, organization.owner_org);
        for endpoint in &organization.endpoints {
            println!(
                "    {} - {} [{} years]",
                endpoint.slug,
                endpoint.name,
                endpoint.periods.len()
            );
        }
    }
    println!("{:-<60}", "");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Dados Abertos Publisher ===");
    println!("Catalog: {}", config.catalog_url);

    let registry = load_registry(&args.config).await?;
    println!("Registry version: {}", registry.version);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .user_agent("DadosAbertosPublisher/1.0 (sincronizacao do portal de transparencia)")
        .build()?;

    // One staging directory per run, so runs never collide on a filename.
    let staging_dir = config
        .staging_root
        .join(format!("publisher-{}", Utc::now().format("%Y%m%d-%H%M%S")));
    fs::create_dir_all(&staging_dir)
        .await
        .context("Failed to create staging directory")?;
    println!("Staging: {}", staging_dir.display());

    let selected: Vec<(&Organization, &Endpoint)> = registry
        .organizations
        .iter()
        .flat_map(|org| org.endpoints.iter().map(move |e| (org, e)))
        .filter(|(_, e)| args.endpoint.as_ref().map_or(true, |f| &e.slug == f))
        .collect();

    if selected.is_empty() {
        print_registry_summary(&registry);
        anyhow::bail!("No endpoints match the filter criteria");
    }

    println!("\nProcessing {} endpoint(s)...", selected.len());

    let mut published = 0;
    let mut skipped = 0;
    let mut failed = 0;

    for (organization, endpoint) in selected {
        println!("\n[{}] {} ({})", endpoint.slug, endpoint.name, organization.name);

        // The package is resolved once per endpoint, before any year runs.
        // A package failure aborts this endpoint's years, nothing else.
        let package_id = if args.dry_run {
            "(dry-run)".to_string()
        } else {
            match ensure_package(&client, &config, &organization.owner_org, endpoint).await {
                Ok(id) => id,
                Err(e) => {
                    eprintln!("  ✗ Package resolution failed, skipping endpoint: {}", e);
                    failed += endpoint.periods.len();
                    continue;
                }
            }
        };

        let transform = Transform::for_endpoint(&endpoint.slug);

        for &year in &endpoint.periods {
            println!("  Year {}: fetching {}", year, endpoint.url);
            match process_year(
                &client,
                &config,
                endpoint,
                transform,
                &package_id,
                &staging_dir,
                year,
                args.dry_run,
            )
            .await
            {
                Ok(Some(resource_id)) => {
                    println!("  ✓ Published {}: {}", year, resource_id);
                    published += 1;
                }
                Ok(None) => {
                    println!("  - No data for {}", year);
                    skipped += 1;
                }
                Err(e) => {
                    eprintln!("  ✗ Failed {} {}: {}", endpoint.slug, year, e);
                    failed += 1;
                }
            }
        }
    }

    println!("\n=== Sync Summary ===");
    println!("Published: {}", published);
    println!("No data: {}", skipped);
    println!("Failed: {}", failed);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
