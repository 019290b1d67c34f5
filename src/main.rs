use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;

use geofill::normalize::build_ladder;
use geofill::records::{EnrichProgress, ProgressObserver};
use geofill::{
    init_tracing, AppConfig, CsvEnricher, FallbackGeocoder, GeoCache, GeocodeClient,
    MultiProviderGeocoder, ProviderKind, ReviewLog, SqlRewriter, TableRule,
};

const PROGRESS_EVERY: usize = 25;

#[derive(Parser)]
#[command(name = "geofill")]
#[command(author, version, about = "Fill latitude/longitude for Japanese addresses in CSV files and SQL dumps", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add coordinates to every row of a CSV file
    Csv {
        /// CSV file with an address column
        input: PathBuf,

        /// Output file (default: <stem>_geocoded.csv next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Cache file (default: <stem>_geocode_cache.csv next to the input)
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Directory for the manual-review log (default: the input's directory)
        #[arg(long)]
        review_dir: Option<PathBuf>,

        /// Contact address sent to the geocoding service
        #[arg(long)]
        email: Option<String>,

        /// Geocoding backend
        #[arg(short, long, value_enum, default_value = "nominatim")]
        provider: ProviderArg,
    },

    /// Add or fill lat/lng in INSERT statements of a SQL dump
    Sql {
        /// SQL script to rewrite
        input: PathBuf,

        /// Where to write the rewritten script
        output: PathBuf,

        /// Cache file (default: <stem>_geocode_cache.csv next to the input)
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Table to rewrite as TABLE=PIVOT (can be given multiple times)
        #[arg(short, long = "table", value_name = "TABLE=PIVOT")]
        tables: Vec<String>,

        /// Directory for the manual-review log (default: the input's directory)
        #[arg(long)]
        review_dir: Option<PathBuf>,

        /// Contact address sent to the geocoding service
        #[arg(long)]
        email: Option<String>,

        /// Geocoding backend
        #[arg(short, long, value_enum, default_value = "nominatim")]
        provider: ProviderArg,
    },

    /// Look up one free-text query across all configured providers
    Lookup {
        query: String,
    },

    /// Print the degradation candidates for an address
    Ladder {
        address: String,

        /// Postal code to append to the first candidate
        #[arg(long)]
        postal: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProviderArg {
    Nominatim,
    Gsi,
    GeocodingJp,
    Csis,
}

impl From<ProviderArg> for ProviderKind {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Nominatim => ProviderKind::Nominatim,
            ProviderArg::Gsi => ProviderKind::Gsi,
            ProviderArg::GeocodingJp => ProviderKind::GeocodingJp,
            ProviderArg::Csis => ProviderKind::Csis,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let mut config = AppConfig::from_env();

    match cli.command {
        Commands::Csv {
            input,
            output,
            cache,
            review_dir,
            email,
            provider,
        } => {
            apply_email(&mut config, email);
            csv_command(&config, &input, output, cache, review_dir, provider.into()).await
        }
        Commands::Sql {
            input,
            output,
            cache,
            tables,
            review_dir,
            email,
            provider,
        } => {
            apply_email(&mut config, email);
            sql_command(&config, &input, &output, cache, tables, review_dir, provider.into()).await
        }
        Commands::Lookup { query } => lookup_command(&config, &query).await,
        Commands::Ladder { address, postal } => ladder_command(&address, postal.as_deref()),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.public_profile())?);
            Ok(())
        }
    }
}

fn apply_email(config: &mut AppConfig, email: Option<String>) {
    if let Some(email) = email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()) {
        config.contact_email = Some(email);
    }
}

fn ensure_input(input: &Path) -> Result<()> {
    if !input.is_file() {
        bail!("input file not found: {}", input.display());
    }
    Ok(())
}

fn sibling_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or("geofill");
    input.with_file_name(format!("{stem}{suffix}"))
}

fn review_log(config: &AppConfig, input: &Path, review_dir: Option<PathBuf>) -> Result<ReviewLog> {
    let dir = review_dir.unwrap_or_else(|| {
        input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    ReviewLog::new(&dir, config)
        .with_context(|| format!("failed to open review log in {}", dir.display()))
}

fn open_geocoder(
    config: &AppConfig,
    input: &Path,
    cache: Option<PathBuf>,
    provider: ProviderKind,
) -> Result<FallbackGeocoder<GeocodeClient>> {
    let cache_path = cache.unwrap_or_else(|| sibling_path(input, "_geocode_cache.csv"));
    let cache = GeoCache::load(&cache_path)
        .with_context(|| format!("failed to load cache {}", cache_path.display()))?;
    let client = GeocodeClient::from_config(provider, config)
        .with_context(|| format!("failed to build {provider} client"))?;
    Ok(FallbackGeocoder::new(client, cache))
}

fn count_csv_rows(input: &Path) -> Result<usize> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(input)?;
    Ok(reader.records().filter(|record| record.is_ok()).count())
}

async fn csv_command(
    config: &AppConfig,
    input: &Path,
    output: Option<PathBuf>,
    cache: Option<PathBuf>,
    review_dir: Option<PathBuf>,
    provider: ProviderKind,
) -> Result<()> {
    ensure_input(input)?;
    let output = output.unwrap_or_else(|| sibling_path(input, "_geocoded.csv"));
    let mut geocoder = open_geocoder(config, input, cache, provider)?;
    let review = review_log(config, input, review_dir)?;

    let rows = count_csv_rows(input).context("failed to read input CSV")?;
    info!(
        rows,
        provider = %provider,
        estimated = ?geocoder.client().rate_limiter().estimate(rows),
        "starting csv batch; estimate assumes one request per row"
    );

    let observer: ProgressObserver = Arc::new(|progress: EnrichProgress| {
        if progress.processed % PROGRESS_EVERY == 0 || progress.processed == progress.total_rows {
            info!(
                processed = progress.processed,
                total = progress.total_rows,
                resolved = progress.resolved,
                "csv progress"
            );
        }
    });

    let origin = input.file_name().and_then(OsStr::to_str).unwrap_or("csv");
    let stats = CsvEnricher::default()
        .with_origin(origin)
        .enrich_file(input, &output, &mut geocoder, Some(&review), Some(observer))
        .await
        .with_context(|| format!("failed to enrich {}", input.display()))?;

    geocoder.save_cache().context("failed to save geocode cache")?;
    review.flush().context("failed to flush review log")?;
    info!(output = %output.display(), "csv written");
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "output": output,
            "rows": stats,
            "lookups": geocoder.stats(),
        }))?
    );
    Ok(())
}

async fn sql_command(
    config: &AppConfig,
    input: &Path,
    output: &Path,
    cache: Option<PathBuf>,
    tables: Vec<String>,
    review_dir: Option<PathBuf>,
    provider: ProviderKind,
) -> Result<()> {
    ensure_input(input)?;
    let rewriter = if tables.is_empty() {
        SqlRewriter::default()
    } else {
        let rules = tables
            .iter()
            .map(|spec| TableRule::parse(spec))
            .collect::<Result<Vec<_>, _>>()?;
        SqlRewriter::new(rules)
    };
    let origin = input.file_name().and_then(OsStr::to_str).unwrap_or("sql");
    let rewriter = rewriter.with_origin(origin);

    let script = fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let mut geocoder = open_geocoder(config, input, cache, provider)?;
    let review = review_log(config, input, review_dir)?;

    let rows = rewriter.count_target_rows(&script);
    info!(
        rows,
        provider = %provider,
        estimated = ?geocoder.client().rate_limiter().estimate(rows),
        "starting sql batch; estimate assumes one request per tuple"
    );

    let (rewritten, stats) = rewriter
        .rewrite_script(&script, &mut geocoder, Some(&review))
        .await
        .context("failed to rewrite SQL")?;
    fs::write(output, rewritten)
        .with_context(|| format!("failed to write {}", output.display()))?;

    geocoder.save_cache().context("failed to save geocode cache")?;
    review.flush().context("failed to flush review log")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "output": output,
            "statements": stats,
            "lookups": geocoder.stats(),
        }))?
    );
    Ok(())
}

async fn lookup_command(config: &AppConfig, query: &str) -> Result<()> {
    let geocoder = MultiProviderGeocoder::from_config(config)?;
    let body = match geocoder.geocode(query).await {
        Some(result) => json!({
            "query": query,
            "found": true,
            "latitude": result.latitude(),
            "longitude": result.longitude(),
            "provider": result.provider(),
            "raw": result.raw(),
        }),
        None => json!({ "query": query, "found": false }),
    };
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn ladder_command(address: &str, postal: Option<&str>) -> Result<()> {
    for (step, candidate) in build_ladder(address, postal).iter().enumerate() {
        println!("{step}\t{candidate}");
    }
    Ok(())
}
