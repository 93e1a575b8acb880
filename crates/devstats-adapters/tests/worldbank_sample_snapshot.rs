use devstats_adapters::{load_fixture_bundle, FixtureSource, StatisticsSource};

fn bundle_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/worldbank/sample/bundle.json")
}

#[test]
fn worldbank_sample_bundle_loads() {
    let bundle = load_fixture_bundle(bundle_path()).expect("bundle");
    assert_eq!(bundle.source_id, "worldbank");
    assert_eq!(bundle.indicators.len(), 3);
    assert_eq!(bundle.frames.len(), 3);
    assert!(bundle.entities.iter().any(|e| e.id == "WLD" && e.region.is_none()));
}

#[tokio::test]
async fn worldbank_sample_frames_follow_requested_years() {
    let source = FixtureSource::from_path(bundle_path()).expect("fixture source");
    assert_eq!(source.bundle().fixture_id, "worldbank-sample-2019-2021");
    assert_eq!(source.source_id(), source.bundle().source_id);
    let frame = source
        .indicator_frame("SP.DYN.LE00.IN", &[2020, 2021])
        .await
        .expect("frame");
    assert!(frame
        .rows
        .iter()
        .all(|row| row.cells.keys().all(|label| label == "YR2020" || label == "YR2021")));
    assert_eq!(frame.cell_count(), frame.rows.len() * 2);
}
