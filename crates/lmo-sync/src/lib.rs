//! Launch dataset pipeline: fetch, parse, classify, aggregate, fingerprint.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Utc};
use lmo_adapters::{parse_document, ParseStats};
use lmo_core::{
    ClassifiedLaunch, LaunchRecord, OrbitCategory, SchemaFamily, SeriesPoint, Source, YearSeries,
};
use lmo_storage::{
    CacheStore, FetchOutcome, HttpClientConfig, HttpTransport, ReqwestTransport, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lmo-sync";

pub const DEFAULT_FETCH_CONCURRENCY: usize = 5;
/// First year that gets a cumulative series.
pub const DEFAULT_SERIES_FROM_YEAR: i32 = 2017;
pub const FINGERPRINT_FILE: &str = "data_hash.txt";
pub const SOURCES_FILE: &str = "sources.yaml";

const BUILTIN_SOURCES: &[(&str, &str, SchemaFamily)] = &[
    (
        "falcon-2010-2019",
        "https://en.wikipedia.org/wiki/List_of_Falcon_9_and_Falcon_Heavy_launches_(2010%E2%80%932019)",
        SchemaFamily::Falcon,
    ),
    (
        "falcon-2020-2022",
        "https://en.wikipedia.org/wiki/List_of_Falcon_9_and_Falcon_Heavy_launches_(2020%E2%80%932022)",
        SchemaFamily::Falcon,
    ),
    (
        "falcon-2023",
        "https://en.wikipedia.org/wiki/List_of_Falcon_9_and_Falcon_Heavy_launches_(2023)",
        SchemaFamily::Falcon,
    ),
    (
        "falcon-current",
        "https://en.wikipedia.org/wiki/List_of_Falcon_9_and_Falcon_Heavy_launches",
        SchemaFamily::Falcon,
    ),
    (
        "starship",
        "https://en.wikipedia.org/wiki/List_of_Starship_launches",
        SchemaFamily::Starship,
    ),
];

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    pub family: SchemaFamily,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: BUILTIN_SOURCES
                .iter()
                .map(|(id, url, family)| SourceConfig {
                    id: id.to_string(),
                    url: url.to_string(),
                    family: *family,
                    enabled: true,
                })
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Reads `path` when it exists, otherwise falls back to the built-in list.
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Source {
                id: s.id.clone(),
                url: s.url.clone(),
                family: s.family,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sources: Vec<Source>,
    pub cache_dir: PathBuf,
    pub fetch_concurrency: usize,
    pub user_agent: String,
    pub series_from_year: i32,
}

impl PipelineConfig {
    pub fn new(sources: Vec<Source>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            cache_dir: cache_dir.into(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            series_from_year: DEFAULT_SERIES_FROM_YEAR,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `LMO_*` settings resolved through `lookup`.
    /// Unparsable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let workspace_root = lookup("LMO_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let registry = SourceRegistry::load_or_builtin(&workspace_root.join(SOURCES_FILE))?;

        Ok(Self {
            sources: registry.enabled_sources(),
            cache_dir: lookup("LMO_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join(".cache")),
            fetch_concurrency: lookup("LMO_FETCH_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_FETCH_CONCURRENCY)
                .max(1),
            user_agent: lookup("LMO_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            series_from_year: lookup("LMO_SERIES_FROM_YEAR")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SERIES_FROM_YEAR),
        })
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.cache_dir.join(FINGERPRINT_FILE)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub source: Source,
    pub outcome: FetchOutcome,
    pub body: Vec<u8>,
}

/// Fetches sources through the cache with at most `concurrency` requests in flight.
#[derive(Debug, Clone)]
pub struct Fetcher {
    cache: CacheStore,
    concurrency: usize,
}

impl Fetcher {
    pub fn new(cache: CacheStore, concurrency: usize) -> Self {
        Self {
            cache,
            concurrency: concurrency.max(1),
        }
    }

    /// Results come back in source order, and failures are detected in that order too:
    /// the run aborts on the first failing source once every earlier source has
    /// finished. Requests already in flight are left to finish and their results dropped.
    pub async fn fetch_all(&self, sources: &[Source]) -> Result<Vec<FetchedDocument>> {
        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources.iter().cloned() {
            let cache = self.cache.clone();
            let limit = Arc::clone(&limit);
            handles.push(tokio::spawn(async move {
                let _permit = limit.acquire().await.context("fetch pool closed")?;
                let fetched = cache
                    .fetch(&source.id, &source.url)
                    .await
                    .with_context(|| format!("fetching source {}", source.id))?;
                Ok::<_, anyhow::Error>(FetchedDocument {
                    source,
                    outcome: fetched.outcome,
                    body: fetched.body,
                })
            }));
        }

        let mut documents = Vec::with_capacity(handles.len());
        for handle in handles {
            documents.push(handle.await.context("fetch worker panicked")??);
        }
        Ok(documents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PivotRow {
    pub year: i32,
    /// Indexed by [`OrbitCategory::legend_index`].
    pub masses_kg: [u64; 10],
}

impl PivotRow {
    pub fn mass_for(&self, category: OrbitCategory) -> u64 {
        self.masses_kg[category.legend_index()]
    }

    pub fn total_kg(&self) -> u64 {
        self.masses_kg.iter().sum()
    }
}

/// Delivered mass per (year, orbit category), columns in legend order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadPivot {
    pub rows: Vec<PivotRow>,
}

impl PayloadPivot {
    pub fn build(launches: &[ClassifiedLaunch]) -> Self {
        let mut by_year: BTreeMap<i32, [u64; 10]> = BTreeMap::new();
        for launch in launches {
            let masses = by_year.entry(launch.record.year).or_insert([0; 10]);
            let cell = &mut masses[launch.category.legend_index()];
            *cell = cell.saturating_add(launch.record.payload_mass_kg);
        }
        Self {
            rows: by_year
                .into_iter()
                .map(|(year, masses_kg)| PivotRow { year, masses_kg })
                .collect(),
        }
    }

    pub fn categories(&self) -> [OrbitCategory; 10] {
        OrbitCategory::ALL
    }

    pub fn row(&self, year: i32) -> Option<&PivotRow> {
        self.rows.iter().find(|r| r.year == year)
    }

    pub fn year_totals(&self) -> Vec<(i32, u64)> {
        self.rows.iter().map(|r| (r.year, r.total_kg())).collect()
    }
}

fn midnight(date: NaiveDate) -> Option<NaiveDateTime> {
    date.and_hms_opt(0, 0, 0)
}

/// Per-year running mass totals for years `>= from_year`.
///
/// Each series opens with a zero anchor on January 1 and closes with a
/// carry-forward anchor on December 31, or on `today` for the current year.
/// The closing anchor never precedes the last launch of the year.
pub fn cumulative_series<'a>(
    records: impl IntoIterator<Item = &'a LaunchRecord>,
    from_year: i32,
    today: NaiveDate,
) -> Vec<YearSeries> {
    let mut sorted = records
        .into_iter()
        .filter(|r| r.year >= from_year)
        .collect::<Vec<_>>();
    sorted.sort_by_key(|r| r.timestamp);

    let mut by_year: BTreeMap<i32, Vec<&LaunchRecord>> = BTreeMap::new();
    for record in sorted {
        by_year.entry(record.year).or_default().push(record);
    }

    let mut series = Vec::with_capacity(by_year.len());
    for (year, launches) in by_year {
        let Some(start) = NaiveDate::from_ymd_opt(year, 1, 1).and_then(midnight) else {
            continue;
        };
        let period_end = if year == today.year() {
            midnight(today)
        } else {
            NaiveDate::from_ymd_opt(year, 12, 31).and_then(midnight)
        };
        let Some(period_end) = period_end else {
            continue;
        };

        let mut points = Vec::with_capacity(launches.len() + 2);
        points.push(SeriesPoint {
            day_of_year: start.ordinal(),
            timestamp: start,
            cumulative_mass_kg: 0,
            synthetic: true,
        });

        let mut running = 0u64;
        for launch in launches {
            running = running.saturating_add(launch.payload_mass_kg);
            points.push(SeriesPoint {
                day_of_year: launch.timestamp.ordinal(),
                timestamp: launch.timestamp,
                cumulative_mass_kg: running,
                synthetic: false,
            });
        }

        let last_seen = points.last().map(|p| p.timestamp).unwrap_or(start);
        let end = period_end.max(last_seen);
        points.push(SeriesPoint {
            day_of_year: end.ordinal(),
            timestamp: end,
            cumulative_mass_kg: running,
            synthetic: true,
        });

        series.push(YearSeries { year, points });
    }
    series
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFingerprint(String);

impl DatasetFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
struct CanonicalRecord<'a> {
    year: i32,
    raw_orbit: &'a str,
    payload: &'a str,
    payload_mass_kg: u64,
    timestamp: String,
    vehicle: String,
}

/// SHA-256 over the sorted, JSON-encoded record collection. Input order is irrelevant.
pub fn fingerprint<'a>(
    records: impl IntoIterator<Item = &'a LaunchRecord>,
) -> Result<DatasetFingerprint> {
    let mut canonical = records
        .into_iter()
        .map(|r| CanonicalRecord {
            year: r.year,
            raw_orbit: &r.raw_orbit,
            payload: &r.payload,
            payload_mass_kg: r.payload_mass_kg,
            timestamp: r.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
            vehicle: r.vehicle.to_string(),
        })
        .collect::<Vec<_>>();
    canonical.sort();

    let encoded = serde_json::to_vec(&canonical).context("encoding canonical records")?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(DatasetFingerprint(hex::encode(hasher.finalize())))
}

/// Remembers the last dataset fingerprint in a single text file.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    path: PathBuf,
}

impl ChangeDetector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn previous(&self) -> Result<Option<DatasetFingerprint>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(DatasetFingerprint(text.trim().to_string()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    /// Compares against the stored fingerprint, then stores `current`.
    /// A missing stored fingerprint counts as changed.
    pub async fn observe(&self, current: &DatasetFingerprint) -> Result<bool> {
        let changed = self.previous().await?.as_ref() != Some(current);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.path, current.as_str())
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(changed)
    }

    pub async fn has_changed<'a>(
        &self,
        records: impl IntoIterator<Item = &'a LaunchRecord>,
    ) -> Result<bool> {
        let current = fingerprint(records)?;
        self.observe(&current).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: Source,
    pub fetch: FetchOutcome,
    pub bytes: usize,
    pub stats: ParseStats,
}

/// Everything a renderer or exporter needs from one run.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchDataset {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub launches: Vec<ClassifiedLaunch>,
    pub pivot: PayloadPivot,
    pub cumulative: Vec<YearSeries>,
    pub fingerprint: DatasetFingerprint,
    pub changed: bool,
}

impl LaunchDataset {
    pub fn parse_stats(&self) -> ParseStats {
        let mut total = ParseStats::default();
        for report in &self.sources {
            total.absorb(&report.stats);
        }
        total
    }
}

pub struct LaunchPipeline {
    config: PipelineConfig,
    fetcher: Fetcher,
    change_detector: ChangeDetector,
}

impl LaunchPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(HttpClientConfig {
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: PipelineConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let cache = CacheStore::new(config.cache_dir.clone(), transport);
        let fetcher = Fetcher::new(cache, config.fetch_concurrency);
        let change_detector = ChangeDetector::new(config.fingerprint_path());
        Self {
            config,
            fetcher,
            change_detector,
        }
    }

    pub async fn run_once(&self) -> Result<LaunchDataset> {
        self.run_at(Local::now().date_naive()).await
    }

    /// Runs the pipeline with `today` deciding where the current year's series ends.
    pub async fn run_at(&self, today: NaiveDate) -> Result<LaunchDataset> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(run_id, today).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, today: NaiveDate) -> Result<LaunchDataset> {
        let started_at = Utc::now();
        let documents = self.fetcher.fetch_all(&self.config.sources).await?;

        let mut records = Vec::new();
        let mut reports = Vec::with_capacity(documents.len());
        for doc in documents {
            let html = String::from_utf8_lossy(&doc.body);
            let parsed = parse_document(&html, doc.source.family)
                .with_context(|| format!("parsing source {}", doc.source.id))?;
            info!(
                source_id = %doc.source.id,
                fetch = ?doc.outcome,
                accepted = parsed.stats.accepted,
                skipped = parsed.stats.skipped(),
                "parsed source"
            );
            reports.push(SourceReport {
                source: doc.source,
                fetch: doc.outcome,
                bytes: doc.body.len(),
                stats: parsed.stats,
            });
            records.extend(parsed.records);
        }

        let fingerprint = fingerprint(&records)?;
        let launches = records
            .into_iter()
            .map(ClassifiedLaunch::classify)
            .collect::<Vec<_>>();
        let pivot = PayloadPivot::build(&launches);
        let cumulative = cumulative_series(
            launches.iter().map(|l| &l.record),
            self.config.series_from_year,
            today,
        );
        let changed = self.change_detector.observe(&fingerprint).await?;

        info!(
            launches = launches.len(),
            years = pivot.rows.len(),
            %fingerprint,
            changed,
            "run complete"
        );

        Ok(LaunchDataset {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: reports,
            launches,
            pivot,
            cumulative,
            fingerprint,
            changed,
        })
    }
}
