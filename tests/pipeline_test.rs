use chrono::{TimeZone, Utc};
use migration_stats::config::{ApiKeys, Settings};
use migration_stats::geography::resolve_state;
use migration_stats::infra::ScriptedHttp;
use migration_stats::pipeline::ingestion::RetryPolicy;
use migration_stats::pipeline::storage::{Table, TableSchema, TableStore};
use migration_stats::pipeline::{PeriodStatus, Pipeline, RunPlan};
use migration_stats::types::{
    CanonicalRecord, FieldValue, GeographyLevel, MetricFamily, Provenance, Provider, TimePeriod,
};
use migration_stats::HarmonizeError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const POVERTY_2018: &str = include_str!("resources/census_poverty_2018.json");
const POVERTY_2018_REVISED: &str = include_str!("resources/census_poverty_2018_revised.json");
const POVERTY_2019: &str = include_str!("resources/census_poverty_2019.json");
const IPUMS_1970: &str = include_str!("resources/ipums_usa_1970.csv");
const FRED_GDP: &str = include_str!("resources/fred_gdp.json");

fn settings(output: &Path) -> Settings {
    Settings {
        api_keys: ApiKeys {
            census: None,
            fred: Some("fred-key".into()),
            ipums: Some("ipums-key".into()),
        },
        output_dir: output.to_path_buf(),
        retry: RetryPolicy::no_delay(2),
        ipums_poll_interval: Duration::ZERO,
        ipums_poll_timeout: Duration::from_secs(30),
        ..Settings::default()
    }
}

fn pipeline(output: &Path, http: &Arc<ScriptedHttp>) -> Pipeline {
    Pipeline::from_settings(&settings(output), http.clone()).unwrap()
}

fn plan(adapter: &str, years: &[i32]) -> RunPlan {
    RunPlan {
        adapters: vec![adapter.to_string()],
        level: None,
        years: Some(years.iter().copied().map(TimePeriod).collect()),
    }
}

fn family(name: &str) -> MetricFamily {
    MetricFamily::new(name).unwrap()
}

fn load(output: &Path, provider: Provider, family_name: &str) -> Table {
    let store = TableStore::new(output);
    store
        .load(&store.table_path(provider, &family(family_name)))
        .unwrap()
        .expect("table was written")
}

#[tokio::test]
async fn poverty_rate_is_derived_and_null_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    http.get("/2018/acs/acs5?", 200, POVERTY_2018);
    http.get("/2019/acs/acs5?", 200, POVERTY_2019);

    let report = pipeline(dir.path(), &http)
        .run(&plan("acs5_poverty", &[2018, 2019]))
        .await
        .unwrap();
    assert!(report.any_succeeded());
    assert_eq!(report.failures().count(), 0);

    let table = load(dir.path(), Provider::CensusAcs, "poverty");
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.rows[0].time_period, TimePeriod(2018));
    assert_eq!(table.rows[0].derived_value(), Some(0.15));
    assert_eq!(table.rows[1].time_period, TimePeriod(2019));
    assert_eq!(table.rows[1].value("below_poverty"), None);
    assert_eq!(table.rows[1].derived_value(), None);
    assert!(!table.rows[0].provenance.query.contains("key="));
}

#[tokio::test]
async fn rerun_replaces_rows_instead_of_appending() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    http.get("/2018/acs/acs5?", 200, POVERTY_2018);
    http.get("/2019/acs/acs5?", 200, POVERTY_2019);
    pipeline(dir.path(), &http)
        .run(&plan("acs5_poverty", &[2018, 2019]))
        .await
        .unwrap();

    let http = Arc::new(ScriptedHttp::new());
    http.get("/2018/acs/acs5?", 200, POVERTY_2018_REVISED);
    http.get("/2019/acs/acs5?", 200, POVERTY_2019);
    let second = pipeline(dir.path(), &http);
    second.run(&plan("acs5_poverty", &[2018, 2019])).await.unwrap();

    let table = load(dir.path(), Provider::CensusAcs, "poverty");
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.rows[0].derived_value(), Some(0.16));
    assert_eq!(table.rows[0].provenance.run_id, second.run_id());
}

#[tokio::test]
async fn identical_runs_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    http.get("/2018/acs/acs5?", 200, POVERTY_2018);

    pipeline(dir.path(), &http).run(&plan("acs5_poverty", &[2018])).await.unwrap();
    let once = load(dir.path(), Provider::CensusAcs, "poverty");
    pipeline(dir.path(), &http).run(&plan("acs5_poverty", &[2018])).await.unwrap();
    let twice = load(dir.path(), Provider::CensusAcs, "poverty");

    assert_eq!(twice.rows.len(), 1);
    assert_eq!(once.rows[0].values, twice.rows[0].values);
    assert_eq!(once.rows[0].derived, twice.rows[0].derived);
    assert_eq!(once.rows[0].provenance.query_id, twice.rows[0].provenance.query_id);
}

#[tokio::test]
async fn unsupported_county_request_fails_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    let plan = RunPlan {
        adapters: vec!["acs5_poverty".into()],
        level: Some(GeographyLevel::County),
        years: Some(vec![TimePeriod(2018)]),
    };

    let report = pipeline(dir.path(), &http).run(&plan).await.unwrap();

    assert_eq!(http.call_count(), 0);
    assert!(!report.any_succeeded());
    assert!(matches!(
        report.periods[0].status,
        PeriodStatus::Failed { kind: "capability", .. }
    ));
}

#[tokio::test]
async fn failed_periods_do_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    http.get("/2018/acs/acs5?", 503, "Service Unavailable");
    http.get("/2019/acs/acs5?", 200, POVERTY_2019);

    let report = pipeline(dir.path(), &http)
        .run(&plan("acs5_poverty", &[2018, 2019]))
        .await
        .unwrap();

    // 2018 was retried once before giving up.
    assert_eq!(http.calls_matching("/2018/"), 2);
    assert!(report.any_succeeded());
    let failed: Vec<i32> = report.failures().map(|p| p.period.year()).collect();
    assert_eq!(failed, vec![2018]);
    assert_eq!(load(dir.path(), Provider::CensusAcs, "poverty").rows.len(), 1);
}

#[tokio::test]
async fn missing_years_are_recorded_as_null_rows() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    http.get("series_id=NYGDPMKTPCDPRI", 200, FRED_GDP);

    let report = pipeline(dir.path(), &http)
        .run(&plan("fred_gdp", &[2022, 2023, 2024]))
        .await
        .unwrap();

    assert_eq!(http.call_count(), 1);
    assert_eq!(report.periods[2].status, PeriodStatus::NoData { rows: 1 });
    let table = load(dir.path(), Provider::Fred, "gdp");
    assert_eq!(table.rows.len(), 3);
    assert_eq!(table.rows[0].geography_name, "Puerto Rico");
    assert_eq!(table.rows[1].value("gdp_current_usd"), Some(117_902_300_000.0));
    assert_eq!(table.rows[2].value("gdp_current_usd"), None);
}

#[tokio::test]
async fn ipums_extract_is_aggregated_to_states() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    http.post("/extracts?collection=usa", 200, r#"{"number": 77, "status": "queued"}"#);
    http.get("/extracts/77?", 200, r#"{"number": 77, "status": "queued"}"#);
    http.get(
        "/extracts/77?",
        200,
        r#"{"number": 77, "status": "completed", "downloadLinks": {"data": {"url": "https://api.ipums.org/downloads/usa/api/v1/extracts/77/usa_00077.csv"}}}"#,
    );
    http.get("/downloads/usa/", 200, IPUMS_1970);

    let report = pipeline(dir.path(), &http)
        .run(&plan("ipums_population", &[1970]))
        .await
        .unwrap();

    match &report.periods[0].status {
        PeriodStatus::Written {
            rows,
            skipped_geographies,
        } => {
            assert_eq!(*rows, 2);
            assert_eq!(skipped_geographies, &vec!["99".to_string()]);
        }
        other => panic!("unexpected status {other:?}"),
    }
    let table = load(dir.path(), Provider::Ipums, "population");
    let ids: Vec<&str> = table.rows.iter().map(|r| r.geography_id.as_str()).collect();
    assert_eq!(ids, vec!["34", "36"]);
    assert_eq!(table.rows[1].value("puerto_rican"), Some(200.0));
}

#[tokio::test]
async fn downloaded_extract_survives_a_failed_table_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(dir.path());
    let table = store.table_path(Provider::Ipums, &family("population"));
    let other_layout = TableSchema {
        metric_family: Some(family("population")),
        value_columns: vec!["hispanic_total".into()],
        derived_columns: Vec::new(),
    };
    store.write(&table, &other_layout, Vec::new()).unwrap();

    let http = Arc::new(ScriptedHttp::new());
    http.post("/extracts?collection=usa", 200, r#"{"number": 78, "status": "queued"}"#);
    http.get(
        "/extracts/78?",
        200,
        r#"{"number": 78, "status": "completed", "downloadLinks": {"data": {"url": "https://api.ipums.org/downloads/usa/api/v1/extracts/78/usa_00078.csv"}}}"#,
    );
    http.get("/downloads/usa/", 200, IPUMS_1970);

    let report = pipeline(dir.path(), &http)
        .run(&plan("ipums_population", &[1970]))
        .await
        .unwrap();
    assert!(matches!(
        report.periods[0].status,
        PeriodStatus::Failed { kind: "table_schema", .. }
    ));
    let state = store.extracts_dir().join("ipums_population_1970.json");
    assert!(state.exists());

    std::fs::remove_file(&table).unwrap();
    std::fs::remove_file(TableStore::schema_path(&table)).unwrap();

    let offline = Arc::new(ScriptedHttp::new());
    let report = pipeline(dir.path(), &offline)
        .run(&plan("ipums_population", &[1970]))
        .await
        .unwrap();
    assert!(matches!(report.periods[0].status, PeriodStatus::Written { rows: 2, .. }));
    assert_eq!(offline.call_count(), 0);
    assert!(!state.exists());
    assert_eq!(load(dir.path(), Provider::Ipums, "population").rows[1].value("puerto_rican"), Some(200.0));
}

#[tokio::test]
async fn unknown_adapter_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let http = Arc::new(ScriptedHttp::new());
    let err = pipeline(dir.path(), &http)
        .run(&plan("acs5_nothing", &[2018]))
        .await
        .unwrap_err();
    assert!(matches!(err, HarmonizeError::Config(_)));
}

fn population_row(value: f64, provider: Provider, hour: u32) -> CanonicalRecord {
    CanonicalRecord {
        metric_family: family("population"),
        geography_id: resolve_state("36").unwrap().id(),
        geography_name: "New York".into(),
        time_period: TimePeriod(1970),
        values: vec![FieldValue::new("puerto_rican", Some(value))],
        derived: Vec::new(),
        provenance: Provenance {
            provider,
            adapter: format!("{provider}_population"),
            query: "q".into(),
            query_id: format!("{provider}-q"),
            fetched_at: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            run_id: Uuid::new_v4(),
        },
    }
}

#[tokio::test]
async fn combine_keeps_the_latest_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(dir.path());
    let schema = TableSchema {
        metric_family: Some(family("population")),
        value_columns: vec!["puerto_rican".into()],
        derived_columns: Vec::new(),
    };
    store
        .write(
            &store.table_path(Provider::CensusDecennial, &family("population")),
            &schema,
            vec![population_row(500.0, Provider::CensusDecennial, 9)],
        )
        .unwrap();
    store
        .write(
            &store.table_path(Provider::Ipums, &family("population")),
            &schema,
            vec![population_row(520.0, Provider::Ipums, 10)],
        )
        .unwrap();

    let http = Arc::new(ScriptedHttp::new());
    let report = pipeline(dir.path(), &http)
        .combine(&[family("population")], "population_by_state", true)
        .unwrap();
    assert_eq!(report.inputs.len(), 2);
    assert_eq!(report.rows, 1);

    let combined = Table::from_csv(
        schema.clone(),
        "combined",
        &std::fs::read(&report.path).unwrap(),
    )
    .unwrap();
    assert_eq!(combined.rows[0].value("puerto_rican"), Some(520.0));
    assert_eq!(combined.rows[0].provenance.provider, Provider::Ipums);

    let wide = std::fs::read_to_string(report.wide_path.unwrap()).unwrap();
    let mut lines = wide.lines();
    assert_eq!(
        lines.next().unwrap(),
        "geography_name,geography_id,time_period,population.puerto_rican"
    );
    assert_eq!(lines.next().unwrap(), "New York,36,1970,520");
}
