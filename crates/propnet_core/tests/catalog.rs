use propnet_core::catalog::Catalog;
use propnet_core::harness::{CaseOutcome, Status};
use propnet_core::symbol::Category;
use propnet_core::{Evaluate, EvaluationInput, ModelError, TestHarness, Value};
use std::path::PathBuf;

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn load() -> Catalog {
    let root = fixtures();
    Catalog::load_dir(root.join("symbols"), root.join("models")).expect("fixtures should load")
}

#[test]
fn loads_symbols_and_models() {
    let catalog = load();
    assert_eq!(catalog.registry.len(), 8);
    assert_eq!(
        catalog.registry.resolve("structure").unwrap().category,
        Category::Object
    );
    assert_eq!(
        catalog.model_names().collect::<Vec<_>>(),
        ["double_band_gap", "pugh_ratio", "sound_velocity"]
    );
    assert_eq!(catalog.pending().collect::<Vec<_>>(), ["band_gap_lookup"]);
}

#[test]
fn every_fixture_passes() {
    let catalog = load();
    let reports = catalog.run_tests(&TestHarness::default());
    assert_eq!(reports.len(), 3);
    for report in &reports {
        let failures: Vec<_> = report.failures().collect();
        assert!(failures.is_empty(), "{}: {failures:?}", report.model);
        assert_eq!(report.status, Status::Passed, "{}", report.model);
    }
}

#[test]
fn double_band_gap_contract() {
    let catalog = load();
    let model = &catalog.get("double_band_gap").unwrap().model;
    for (e_g, e_d) in [(2.0, 4.0), (5.0, 10.0)] {
        let inputs: EvaluationInput = [("E_g".to_string(), Value::Number(e_g))].into();
        let out = model.evaluate(&inputs).unwrap();
        assert!((out["E_d"].magnitude() - e_d).abs() < 1e-12);
    }
    match model.evaluate(&EvaluationInput::new()) {
        Err(ModelError::Underdetermined { missing, .. }) => assert_eq!(missing, ["E_g"]),
        other => panic!("expected Underdetermined, got {other:?}"),
    }
}

#[test]
fn custom_model_joins_the_catalog() {
    let mut catalog = load();
    catalog
        .attach_routine("band_gap_lookup", |inputs| {
            let gap = if inputs["s"].magnitude() == 1.0 { 1.12 } else { 0.0 };
            Ok([("E_g".to_string(), Value::Number(gap))].into())
        })
        .unwrap();

    let model = &catalog.get("band_gap_lookup").unwrap().model;
    let inputs: EvaluationInput = [("s".to_string(), Value::Number(1.0))].into();
    assert_eq!(model.evaluate(&inputs).unwrap()["E_g"], Value::Number(1.12));

    let reports = catalog.run_tests(&TestHarness::default());
    let lookup = reports
        .iter()
        .find(|report| report.model == "band_gap_lookup")
        .unwrap();
    assert_eq!(lookup.status, Status::Untested);
}

#[test]
fn wrong_expectation_is_reported_not_raised() {
    let catalog = load();
    let entry = catalog.get("pugh_ratio").unwrap();
    let cases = propnet_core::load_test_cases(
        r#"[{"inputs": {"K": 150, "G": 60}, "outputs": {"pugh": 3.0}}]"#,
    )
    .unwrap();
    let report = TestHarness::default().run(&entry.model, &cases);
    assert_eq!(report.status, Status::Failed);
    assert!(matches!(
        &report.cases[0],
        CaseOutcome::Mismatch { diverging, .. } if diverging == &["pugh"]
    ));
}
