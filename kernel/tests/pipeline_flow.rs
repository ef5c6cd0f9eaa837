use std::path::Path;

use serde_json::{json, Value as Json};

use tierlake_kernel::adapters::alphavantage::{Endpoint, ResponseFeed};
use tierlake_kernel::config::LakeConfig;
use tierlake_kernel::pipeline::{run_flow, Flow, FlowReport, SourceFeed};
use tierlake_kernel::record::Value;
use tierlake_kernel::table::{Table, TableError};
use tierlake_kernel::CommitOutcome;

fn daily(days: &[(&str, &str)]) -> Json {
    let series: serde_json::Map<String, Json> = days
        .iter()
        .map(|(day, close)| {
            (
                day.to_string(),
                json!({
                    "1. open": "100.00",
                    "2. high": "120000.00",
                    "3. low": "90.00",
                    "4. close": close,
                    "5. volume": "12.5"
                }),
            )
        })
        .collect();
    json!({
        "Meta Data": { "2. Digital Currency Code": "BTC" },
        "Time Series (Digital Currency Daily)": series
    })
}

struct Lake {
    config: LakeConfig,
    bronze: Table,
    silver: Table,
    gold: Table,
}

impl Lake {
    fn open(root: &Path, feed: &str) -> Self {
        let config = LakeConfig::default_config();
        let flow = &config.flows[feed];
        let open = |layer: &str, name: &str| {
            Table::open(root.join(layer).join(name), config.table_options(name).unwrap())
        };
        let bronze = open("bronze", &flow.bronze);
        let silver = open("silver", &flow.silver);
        let gold = open("gold", &flow.gold);
        Self {
            config,
            bronze,
            silver,
            gold,
        }
    }

    fn run(&self, feed: &ResponseFeed) -> FlowReport {
        let flow_config = &self.config.flows[feed.name()];
        let flow = Flow {
            bronze: &self.bronze,
            silver: &self.silver,
            gold: &self.gold,
            cleaning: flow_config.cleaning().unwrap(),
            aggregate: flow_config.aggregate(),
        };
        run_flow(&flow, feed).unwrap()
    }
}

const DAILY: &str = "alphavantage/digital_currency_daily";

#[test]
fn daily_feed_flows_through_all_layers_and_reruns_are_noops() {
    let root = tempfile::tempdir().unwrap();
    let lake = Lake::open(root.path(), DAILY);
    let feed = ResponseFeed::new(
        Endpoint::DigitalCurrencyDaily,
        daily(&[("2025-10-29", "112766.46"), ("2025-10-30", "110100.00")]),
    );

    let first = lake.run(&feed);
    assert_eq!(first.bronze.version(), 1);
    assert_eq!(first.silver.as_ref().map(CommitOutcome::version), Some(1));
    assert_eq!(first.gold.as_ref().map(CommitOutcome::version), Some(1));

    let gold = lake.gold.read_latest().unwrap().records;
    assert_eq!(gold.num_rows(), 1);
    assert_eq!(gold.value(0, "month"), Some(&Value::from("2025-10")));
    assert_eq!(gold.value(0, "max_close"), Some(&Value::Float64(112766.46)));
    assert_eq!(gold.value(0, "min_close"), Some(&Value::Float64(110100.0)));

    let again = lake.run(&feed);
    assert_eq!(again.bronze, CommitOutcome::NoOp { version: 1 });
    assert_eq!(again.silver, Some(CommitOutcome::NoOp { version: 1 }));
    assert_eq!(again.gold, None);
}

#[test]
fn overlapping_fetch_upserts_and_refreshes_the_summary() {
    let root = tempfile::tempdir().unwrap();
    let lake = Lake::open(root.path(), DAILY);
    lake.run(&ResponseFeed::new(
        Endpoint::DigitalCurrencyDaily,
        daily(&[("2025-10-30", "110100.00"), ("2025-10-31", "109000.00")]),
    ));

    let report = lake.run(&ResponseFeed::new(
        Endpoint::DigitalCurrencyDaily,
        daily(&[("2025-10-31", "111000.00"), ("2025-11-01", "115000.00")]),
    ));

    assert_eq!(report.bronze.version(), 2);
    let bronze = lake.bronze.read_latest().unwrap().records;
    assert_eq!(bronze.num_rows(), 3);

    let gold = lake.gold.read_latest().unwrap().records;
    let months: Vec<&Value> = gold.column("month").unwrap();
    assert_eq!(months, vec![&Value::from("2025-10"), &Value::from("2025-11")]);
    assert_eq!(gold.value(0, "max_close"), Some(&Value::Float64(111000.0)));
    assert_eq!(lake.gold.current_version().unwrap(), 2);
}

#[test]
fn non_positive_close_is_rejected_at_bronze() {
    let root = tempfile::tempdir().unwrap();
    let lake = Lake::open(root.path(), DAILY);
    let feed = ResponseFeed::new(
        Endpoint::DigitalCurrencyDaily,
        daily(&[("2025-10-29", "112766.46"), ("2025-10-30", "0")]),
    );
    let flow_config = &lake.config.flows[DAILY];
    let flow = Flow {
        bronze: &lake.bronze,
        silver: &lake.silver,
        gold: &lake.gold,
        cleaning: flow_config.cleaning().unwrap(),
        aggregate: flow_config.aggregate(),
    };

    let err = run_flow(&flow, &feed).unwrap_err();

    assert!(err.to_string().contains("close>0"), "{err}");
    assert_eq!(lake.bronze.current_version().unwrap(), 0);
    assert_eq!(lake.silver.current_version().unwrap(), 0);
}

#[test]
fn exchange_rate_snapshot_overwrites_and_gold_keeps_latest() {
    let root = tempfile::tempdir().unwrap();
    let lake = Lake::open(root.path(), "alphavantage/currency_exchange_rate");
    let quote = |refreshed: &str, rate: &str| {
        ResponseFeed::new(
            Endpoint::CurrencyExchangeRate,
            json!({
                "Realtime Currency Exchange Rate": {
                    "1. From_Currency Code": "USD",
                    "3. To_Currency Code": "EUR",
                    "5. Exchange Rate": rate,
                    "6. Last Refreshed": refreshed,
                    "8. Bid Price": rate,
                    "9. Ask Price": rate
                }
            }),
        )
    };

    lake.run(&quote("2025-10-30 12:00:01", "0.86120000"));
    let report = lake.run(&quote("2025-10-30 13:00:01", "0.86200000"));

    assert_eq!(report.bronze.version(), 2);
    let bronze = lake.bronze.read_latest().unwrap().records;
    assert_eq!(bronze.num_rows(), 1);
    let gold = lake.gold.read_latest().unwrap().records;
    assert_eq!(gold.num_rows(), 1);
    assert_eq!(gold.value(0, "exchange_rate"), Some(&Value::Float64(0.862)));
    assert_eq!(
        gold.value(0, "last_refreshed"),
        Some(&Value::from("2025-10-30 13:00:01"))
    );
}

#[test]
fn unusable_response_commits_nothing() {
    let root = tempfile::tempdir().unwrap();
    let lake = Lake::open(root.path(), DAILY);
    let feed = ResponseFeed::new(
        Endpoint::DigitalCurrencyDaily,
        json!({ "Information": "rate limit reached" }),
    );
    let flow_config = &lake.config.flows[DAILY];
    let flow = Flow {
        bronze: &lake.bronze,
        silver: &lake.silver,
        gold: &lake.gold,
        cleaning: flow_config.cleaning().unwrap(),
        aggregate: flow_config.aggregate(),
    };

    let err = run_flow(&flow, &feed).unwrap_err();

    assert!(matches!(
        err,
        tierlake_kernel::pipeline::PipelineError::Table(TableError::SourceFeed { ref table, .. })
            if table == "digital_currency_daily"
    ));
    assert_eq!(lake.bronze.current_version().unwrap(), 0);
}
