use crate::bar_utils::{group_bars_by_ticker, normalize_ticker_symbol};
use crate::error::DataError;
use crate::models::{Bar, BarInterval};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;
const CSV_BASE_COLUMNS: [&str; 7] = [
    "ticker",
    "timestamp",
    "open",
    "high",
    "low",
    "close",
    "volume",
];

/// Supplies already-materialized bars to the engine before simulation starts.
///
/// Returned series are sorted ascending and hold one bar per timestamp. Instruments
/// with no data are left out of the map instead of failing the request.
pub trait BarSource {
    fn get_bars(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: BarInterval,
    ) -> Result<BTreeMap<String, Vec<Bar>>, DataError>;
}

#[derive(Debug, Clone)]
pub struct InMemoryBarSource {
    interval: BarInterval,
    bars_by_ticker: Arc<BTreeMap<String, Vec<Bar>>>,
}

impl InMemoryBarSource {
    pub fn new(interval: BarInterval, bars: Vec<Bar>) -> Self {
        Self {
            interval,
            bars_by_ticker: Arc::new(group_bars_by_ticker(bars, None)),
        }
    }

    /// Loads a bincode snapshot, or a CSV file when the extension is `.csv`.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        csv_interval: BarInterval,
    ) -> Result<Self, DataError> {
        let path = path.as_ref();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);

        let source = if is_csv {
            Self::new(csv_interval, import_csv(path)?)
        } else {
            MarketDataSnapshot::load_from_file(path)?.into_source()
        };
        info!(
            "Loaded {} bar{} for {} ticker{} from {}",
            source.bar_count(),
            if source.bar_count() == 1 { "" } else { "s" },
            source.tickers().len(),
            if source.tickers().len() == 1 { "" } else { "s" },
            path.display()
        );
        Ok(source)
    }

    pub fn interval(&self) -> BarInterval {
        self.interval
    }

    pub fn tickers(&self) -> Vec<String> {
        self.bars_by_ticker.keys().cloned().collect()
    }

    pub fn bar_count(&self) -> usize {
        self.bars_by_ticker.values().map(Vec::len).sum()
    }

    pub fn to_snapshot(&self) -> MarketDataSnapshot {
        MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            interval: self.interval,
            generated_at: Utc::now(),
            bars: self.bars_by_ticker.values().flatten().cloned().collect(),
        }
    }
}

impl BarSource for InMemoryBarSource {
    fn get_bars(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: BarInterval,
    ) -> Result<BTreeMap<String, Vec<Bar>>, DataError> {
        if interval != self.interval {
            return Err(DataError::Unavailable(format!(
                "source holds {} bars but {} was requested",
                self.interval, interval
            )));
        }

        let mut result = BTreeMap::new();
        for ticker in tickers {
            let Some(key) = normalize_ticker_symbol(ticker) else {
                continue;
            };
            let Some(series) = self.bars_by_ticker.get(&key) else {
                continue;
            };
            let from = series.partition_point(|bar| bar.timestamp < start);
            let to = series.partition_point(|bar| bar.timestamp <= end);
            if from < to {
                result.insert(key, series[from..to].to_vec());
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    version: u32,
    interval: BarInterval,
    generated_at: DateTime<Utc>,
    bars: Vec<Bar>,
}

impl MarketDataSnapshot {
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn into_source(self) -> InMemoryBarSource {
        InMemoryBarSource::new(self.interval, self.bars)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).map_err(|source| DataError::Decode {
                path: path.to_path_buf(),
                source,
            })?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(DataError::VersionMismatch {
                found: snapshot.version,
                expected: MARKET_DATA_SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), DataError> {
        let path = path.as_ref();
        let io_error = |source: std::io::Error| DataError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }

        let file = File::create(path).map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self).map_err(|source| DataError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io_error)?;
        Ok(())
    }
}

/// Reads `ticker,timestamp,open,high,low,close,volume` rows; any further numeric
/// column is kept as an indicator field on the bar.
pub fn import_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Bar>, DataError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|err| DataError::Csv {
            row: 0,
            message: err.to_string(),
        })?
        .clone();
    let columns: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.to_ascii_lowercase(), idx))
        .collect();
    for required in CSV_BASE_COLUMNS {
        if !columns.contains_key(required) {
            return Err(DataError::Csv {
                row: 0,
                message: format!("missing column {}", required),
            });
        }
    }
    let indicator_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| !CSV_BASE_COLUMNS.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(idx, name)| (idx, name.to_string()))
        .collect();

    let mut bars = Vec::new();
    for (offset, record) in reader.records().enumerate() {
        let row = offset + 1;
        let record = record.map_err(|err| DataError::Csv {
            row,
            message: err.to_string(),
        })?;
        let timestamp_raw = csv_field(&record, &columns, "timestamp", row)?;
        let timestamp = parse_timestamp(timestamp_raw).ok_or_else(|| DataError::Csv {
            row,
            message: format!("invalid timestamp {:?}", timestamp_raw),
        })?;

        let mut indicators = BTreeMap::new();
        for (idx, name) in &indicator_columns {
            if let Some(value) = record.get(*idx).and_then(|raw| raw.parse::<f64>().ok()) {
                indicators.insert(name.clone(), value);
            }
        }

        bars.push(Bar {
            ticker: csv_field(&record, &columns, "ticker", row)?.to_string(),
            timestamp,
            open: csv_number(&record, &columns, "open", row)?,
            high: csv_number(&record, &columns, "high", row)?,
            low: csv_number(&record, &columns, "low", row)?,
            close: csv_number(&record, &columns, "close", row)?,
            volume: csv_number(&record, &columns, "volume", row)?.round() as i64,
            indicators,
        });
    }
    Ok(bars)
}

fn csv_field<'r>(
    record: &'r csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
    row: usize,
) -> Result<&'r str, DataError> {
    columns
        .get(name)
        .and_then(|&idx| record.get(idx))
        .ok_or_else(|| DataError::Csv {
            row,
            message: format!("missing {}", name),
        })
}

fn csv_number(
    record: &csv::StringRecord,
    columns: &HashMap<String, usize>,
    name: &str,
    row: usize,
) -> Result<f64, DataError> {
    let raw = csv_field(record, columns, name, row)?;
    raw.parse::<f64>().map_err(|_| DataError::Csv {
        row,
        message: format!("invalid {} value {:?}", name, raw),
    })
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
