use std::collections::HashMap;
use std::time::Duration;

use stage_golem::metrics::MetricsCollector;
use stage_golem::types::Stage;

fn collector() -> MetricsCollector {
    let mut costs = HashMap::new();
    costs.insert(Stage::Research, 0.001);
    costs.insert(Stage::Triage, 0.0001);
    MetricsCollector::new(costs)
}

#[test]
fn counts_successes_and_failures() {
    let metrics = collector();
    metrics.record(Stage::Triage, true, Duration::from_secs(2), 0);
    metrics.record(Stage::Triage, true, Duration::from_secs(4), 0);
    metrics.record(Stage::Triage, false, Duration::from_secs(6), 0);

    let triage = metrics.stage(Stage::Triage);
    assert_eq!(triage.attempted, 3);
    assert_eq!(triage.succeeded, 2);
    assert_eq!(triage.failed, 1);
    assert!((triage.total_processing_secs - 12.0).abs() < 1e-9);
    assert!((triage.average_processing_secs() - 4.0).abs() < 1e-9);
}

#[test]
fn cost_is_units_times_stage_unit_cost() {
    let metrics = collector();
    metrics.record(Stage::Research, true, Duration::ZERO, 1500);
    metrics.record(Stage::Research, false, Duration::ZERO, 500);
    metrics.record(Stage::Editorial, true, Duration::ZERO, 1000);

    let research = metrics.stage(Stage::Research);
    assert_eq!(research.total_usage_units, 2000);
    assert!((research.total_cost - 2.0).abs() < 1e-9);

    let editorial = metrics.stage(Stage::Editorial);
    assert_eq!(editorial.total_usage_units, 1000);
    assert_eq!(editorial.total_cost, 0.0);
}

#[test]
fn unseen_stage_reports_zeroes() {
    let metrics = collector();
    let response = metrics.stage(Stage::Response);
    assert_eq!(response.attempted, 0);
    assert_eq!(response.average_processing_secs(), 0.0);
    assert!(metrics.snapshot().is_empty());
}

#[test]
fn snapshot_includes_average() {
    let metrics = collector();
    metrics.record(Stage::Triage, true, Duration::from_millis(500), 10);
    metrics.record(Stage::Triage, true, Duration::from_millis(1500), 10);

    let snapshot = metrics.snapshot();
    let triage = &snapshot[&Stage::Triage];
    assert_eq!(triage.metrics.attempted, 2);
    assert!((triage.average_processing_secs - 1.0).abs() < 1e-9);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["triage"]["attempted"], 2);
    assert!(json["triage"]["average_processing_secs"].is_number());
}

#[test]
fn reset_one_stage_or_all() {
    let metrics = collector();
    metrics.record(Stage::Triage, true, Duration::ZERO, 1);
    metrics.record(Stage::Research, true, Duration::ZERO, 1);

    metrics.reset(Some(Stage::Triage));
    assert_eq!(metrics.stage(Stage::Triage).attempted, 0);
    assert_eq!(metrics.stage(Stage::Research).attempted, 1);

    metrics.reset(None);
    assert!(metrics.snapshot().is_empty());
}

#[test]
fn clones_share_counters() {
    let metrics = collector();
    let handle = metrics.clone();
    handle.record(Stage::Response, false, Duration::ZERO, 0);
    assert_eq!(metrics.stage(Stage::Response).failed, 1);
}
