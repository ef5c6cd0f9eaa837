// AlphaVantage Feed Adapter
//
// Parses raw AlphaVantage JSON responses into record batches. Two
// endpoints are understood:
//
// - DIGITAL_CURRENCY_DAILY: a time series keyed by date, extracted
//   incrementally and upserted on `datetime`
// - CURRENCY_EXCHANGE_RATE: a single point-in-time quote, extracted in full
//
// The HTTP client is not part of the kernel; callers hand over the decoded
// response body.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::pipeline::{dedupe_columns, ExtractionMode, FeedBatch, SourceFeed, SourceFeedError};
use crate::record::{DataType, Field, RecordBatch, RecordError, Row, Schema, Value};

/// Natural key of the daily series.
pub const DAILY_KEY: &str = "datetime";
/// Partition column added to the daily series.
pub const DATE_COLUMN: &str = "date";

const EXCHANGE_RATE_SECTION: &str = "Realtime Currency Exchange Rate";
const NUMERIC_QUOTE_COLUMNS: [&str; 3] = ["exchange_rate", "bid_price", "ask_price"];

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("response has no `{section}` section")]
    MissingSection { section: String },

    #[error("`{section}` is not a JSON object")]
    NotAnObject { section: String },

    #[error("invalid record: {0}")]
    Record(#[from] RecordError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Endpoint {
    DigitalCurrencyDaily,
    CurrencyExchangeRate,
}

impl Endpoint {
    pub fn extraction_mode(self) -> ExtractionMode {
        match self {
            Endpoint::DigitalCurrencyDaily => ExtractionMode::incremental([DAILY_KEY]),
            Endpoint::CurrencyExchangeRate => ExtractionMode::Full,
        }
    }

    pub fn parse(self, response: &Json) -> Result<RecordBatch, AdapterError> {
        match self {
            Endpoint::DigitalCurrencyDaily => parse_daily_series(response),
            Endpoint::CurrencyExchangeRate => parse_exchange_rate(response),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::DigitalCurrencyDaily => f.write_str("DIGITAL_CURRENCY_DAILY"),
            Endpoint::CurrencyExchangeRate => f.write_str("CURRENCY_EXCHANGE_RATE"),
        }
    }
}

/// `"1a. open (USD)"` → `"open"`.
fn series_column_name(raw: &str) -> String {
    let tail = raw.rsplit(". ").next().unwrap_or(raw);
    tail.split(" (").next().unwrap_or(tail).to_string()
}

/// `"1. From_Currency Code"` → `"from_currency_code"`.
fn quote_column_name(raw: &str) -> String {
    raw.split(' ').skip(1).collect::<Vec<_>>().join("_").to_lowercase()
}

fn object<'a>(value: &'a Json, section: &str) -> Result<&'a Map<String, Json>, AdapterError> {
    value.as_object().ok_or_else(|| AdapterError::NotAnObject {
        section: section.to_string(),
    })
}

fn numeric(value: Option<&Json>) -> Value {
    let parsed = match value {
        Some(Json::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Json::Number(n)) => n.as_f64(),
        _ => None,
    };
    parsed.map(Value::Float64).unwrap_or(Value::Null)
}

/// Parse a `DIGITAL_CURRENCY_DAILY` response.
///
/// One row per date, sorted by `datetime`. Every series column is numeric
/// (unparseable values become null) and a `date` string column is added.
pub fn parse_daily_series(response: &Json) -> Result<RecordBatch, AdapterError> {
    let root = object(response, "response")?;
    let (section, series) = root
        .iter()
        .find(|(k, _)| k.starts_with("Time Series"))
        .ok_or_else(|| AdapterError::MissingSection {
            section: "Time Series".into(),
        })?;
    let series = object(series, section)?;

    let mut columns: Vec<(String, String)> = Vec::new();
    for day in series.values() {
        for raw in object(day, section)?.keys() {
            let name = series_column_name(raw);
            if name != DAILY_KEY && name != DATE_COLUMN && columns.iter().all(|(n, _)| n != &name) {
                columns.push((name, raw.clone()));
            }
        }
    }

    let mut rows: Vec<Row> = Vec::with_capacity(series.len());
    for (key, day) in series {
        let day = object(day, section)?;
        let datetime = NaiveDate::parse_from_str(key.trim(), "%Y-%m-%d").ok();
        let mut row = Vec::with_capacity(columns.len() + 2);
        row.push(datetime.map(Value::Date).unwrap_or(Value::Null));
        for (name, raw) in &columns {
            let cell = day
                .get(raw)
                .or_else(|| day.iter().find(|(k, _)| &series_column_name(k) == name).map(|(_, v)| v));
            row.push(numeric(cell));
        }
        row.push(
            datetime
                .map(|d| Value::Utf8(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
        );
        rows.push(row);
    }
    rows.sort_by(|a, b| a[0].cmp(&b[0]));

    let width = columns.len() + 2;
    let has_null = |idx: usize| rows.iter().any(|r| r[idx].is_null());
    let mut fields = Vec::with_capacity(width);
    fields.push(Field::new(DAILY_KEY, DataType::Date, has_null(0)));
    for (i, (name, _)) in columns.iter().enumerate() {
        fields.push(Field::new(name.clone(), DataType::Float64, has_null(i + 1)));
    }
    fields.push(Field::new(DATE_COLUMN, DataType::Utf8, has_null(width - 1)));

    Ok(RecordBatch::try_new(Schema::new(fields)?, rows)?)
}

/// Parse a `CURRENCY_EXCHANGE_RATE` response into a single row.
///
/// Values stay strings except the rate and bid/ask prices.
pub fn parse_exchange_rate(response: &Json) -> Result<RecordBatch, AdapterError> {
    let root = object(response, "response")?;
    let quote = root
        .get(EXCHANGE_RATE_SECTION)
        .ok_or_else(|| AdapterError::MissingSection {
            section: EXCHANGE_RATE_SECTION.into(),
        })?;
    let quote = object(quote, EXCHANGE_RATE_SECTION)?;

    let mut names: Vec<String> = Vec::with_capacity(quote.len());
    for raw in quote.keys() {
        let base = quote_column_name(raw);
        let mut name = base.clone();
        let mut counter = 1;
        while names.contains(&name) {
            name = format!("{base}_{counter}");
            counter += 1;
        }
        names.push(name);
    }
    let names = dedupe_columns(&names);

    let mut fields = Vec::with_capacity(names.len());
    let mut row = Vec::with_capacity(names.len());
    for (name, value) in names.into_iter().zip(quote.values()) {
        let cell = if NUMERIC_QUOTE_COLUMNS.contains(&name.as_str()) {
            numeric(Some(value))
        } else {
            match value {
                Json::Null => Value::Null,
                Json::String(s) => Value::Utf8(s.clone()),
                other => Value::Utf8(other.to_string()),
            }
        };
        let data_type = if NUMERIC_QUOTE_COLUMNS.contains(&name.as_str()) {
            DataType::Float64
        } else {
            DataType::Utf8
        };
        fields.push(Field::new(name, data_type, cell.is_null()));
        row.push(cell);
    }

    Ok(RecordBatch::try_new(Schema::new(fields)?, vec![row])?)
}

/// A feed over an already-fetched response body.
#[derive(Debug, Clone)]
pub struct ResponseFeed {
    endpoint: Endpoint,
    response: Json,
}

impl ResponseFeed {
    pub fn new(endpoint: Endpoint, response: Json) -> Self {
        Self { endpoint, response }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl SourceFeed for ResponseFeed {
    fn name(&self) -> &str {
        match self.endpoint {
            Endpoint::DigitalCurrencyDaily => "alphavantage/digital_currency_daily",
            Endpoint::CurrencyExchangeRate => "alphavantage/currency_exchange_rate",
        }
    }

    fn fetch(&self) -> Result<FeedBatch, SourceFeedError> {
        let records = self.endpoint.parse(&self.response).map_err(|e| SourceFeedError {
            feed: self.name().to_string(),
            message: e.to_string(),
        })?;
        Ok(FeedBatch {
            records,
            mode: self.endpoint.extraction_mode(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn daily_response() -> Json {
        json!({
            "Meta Data": { "1. Information": "Daily Prices and Volumes for Digital Currency" },
            "Time Series (Digital Currency Daily)": {
                "2025-10-30": {
                    "1. open": "112766.46",
                    "2. high": "113500.00",
                    "3. low": "109000.10",
                    "4. close": "110100.00",
                    "5. volume": "n/a"
                },
                "2025-10-29": {
                    "1. open": "110000.00",
                    "2. high": "114000.00",
                    "3. low": "109500.00",
                    "4. close": "112766.46",
                    "5. volume": "1523.12"
                }
            }
        })
    }

    #[test]
    fn daily_series_is_normalised_and_sorted() {
        let batch = parse_daily_series(&daily_response()).unwrap();

        let names: Vec<&str> = batch.schema().names().collect();
        assert_eq!(names, vec!["datetime", "open", "high", "low", "close", "volume", "date"]);
        assert_eq!(batch.value(0, "date"), Some(&Value::from("2025-10-29")));
        assert_eq!(batch.value(0, "close"), Some(&Value::Float64(112766.46)));
        assert_eq!(batch.value(1, "volume"), Some(&Value::Null));
        assert!(batch.schema().field("volume").unwrap().nullable);
        assert!(!batch.schema().field("close").unwrap().nullable);
    }

    #[test]
    fn column_names_drop_numbering_and_currency() {
        assert_eq!(series_column_name("1a. open (USD)"), "open");
        assert_eq!(series_column_name("5. volume"), "volume");
        assert_eq!(quote_column_name("1. From_Currency Code"), "from_currency_code");
    }

    #[test]
    fn exchange_rate_becomes_single_row() {
        let response = json!({
            "Realtime Currency Exchange Rate": {
                "1. From_Currency Code": "USD",
                "2. From_Currency Name": "United States Dollar",
                "3. To_Currency Code": "EUR",
                "4. To_Currency Name": "Euro",
                "5. Exchange Rate": "0.86120000",
                "6. Last Refreshed": "2025-10-30 12:00:01",
                "7. Time Zone": "UTC",
                "8. Bid Price": "0.86115000",
                "9. Ask Price": "0.86125000"
            }
        });

        let batch = parse_exchange_rate(&response).unwrap();

        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.value(0, "exchange_rate"), Some(&Value::Float64(0.8612)));
        assert_eq!(
            batch.value(0, "last_refreshed"),
            Some(&Value::from("2025-10-30 12:00:01"))
        );
        assert_eq!(batch.value(0, "to_currency_code"), Some(&Value::from("EUR")));
    }

    #[test]
    fn missing_sections_are_errors() {
        let err = parse_daily_series(&json!({ "Note": "rate limited" })).unwrap_err();
        assert!(matches!(err, AdapterError::MissingSection { .. }));

        let feed = ResponseFeed::new(Endpoint::CurrencyExchangeRate, json!({}));
        let err = feed.fetch().unwrap_err();
        assert_eq!(err.feed, "alphavantage/currency_exchange_rate");
    }
}
