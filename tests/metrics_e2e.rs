use std::sync::Arc;
use std::thread;

use chrono::{NaiveDate, Utc};

use wis2node::metrics::{metric_key, Counts, Metric, TOTAL_DATASET};
use wis2node::{
    Catalog, DatasetDefinition, DispatchPipeline, FileEvent, InMemoryBroker, InMemoryStore,
    KeyValueStore, MetricsRecorder, NodeConfig,
};

fn definition(id: &str, title: &str, subtopic: &str) -> DatasetDefinition {
    DatasetDefinition {
        metadata_id: format!("urn:wmo:md:ca-eccc-msc:{id}"),
        title: Some(title.to_string()),
        subtopic_pattern: subtopic.to_string(),
        regex_filters: Vec::new(),
        topic: format!("data/core/weather/{id}"),
        media_type: "application/octet-stream".to_string(),
        cacheable: true,
        datetime_pattern: None,
    }
}

fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::new(vec![
        definition("model_gem_global", "GEM Global", "model_gem_global.#"),
        definition("radar", "Radar composites", "radar.#"),
    ]))
}

fn config() -> Arc<NodeConfig> {
    let config = NodeConfig::from_lookup(|name| {
        let value = match name.strip_prefix("MSC_WIS2NODE_")? {
            "BROKER_HOSTNAME" => "localhost",
            "BROKER_USERNAME" => "everyone",
            "BROKER_PASSWORD" => "everyone",
            "CENTRE_ID" => "ca-eccc-msc",
            "DATASET_CONFIG" => "/tmp/datasets.json",
            "WIS2_GDC" => "https://gdc.example/items",
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap();
    Arc::new(config)
}

#[test]
fn counters_sum_published_sizes() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = DispatchPipeline::new(config(), catalog(), Arc::new(InMemoryBroker::new()))
        .unwrap()
        .with_metrics(store.clone());

    let sizes = [1_000_u64, 2_500, 40, 0];
    let events: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| FileEvent::new("https://dd.example", format!("radar/{i}.gif"), Some(*size)))
        .chain(std::iter::once(FileEvent::new(
            "https://dd.example",
            "model_gem_global/15km/grib2/00/000/f.grib2",
            None,
        )))
        .collect();
    let report = pipeline.dispatch(events);
    assert_eq!(report.accepted.len(), 5);

    let recorder = MetricsRecorder::new(store);
    let today = Utc::now().date_naive();
    let radar = recorder.counts(today, "urn:wmo:md:ca-eccc-msc:radar").unwrap();
    assert_eq!(radar, Counts { files: 4, bytes: sizes.iter().sum() });
    let gem = recorder.counts(today, "urn:wmo:md:ca-eccc-msc:model_gem_global").unwrap();
    assert_eq!(gem, Counts { files: 1, bytes: 0 });
    let total = recorder.counts(today, TOTAL_DATASET).unwrap();
    assert!(total.files >= radar.files);
    assert_eq!(total.files, 5);
}

#[test]
fn concurrent_recording_loses_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = MetricsRecorder::new(store);
    let day = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

    thread::scope(|s| {
        for worker in 0..8u64 {
            let recorder = &recorder;
            s.spawn(move || {
                for _ in 0..100 {
                    let dataset = if worker % 2 == 0 { "radar" } else { "swob" };
                    recorder.record_on(day, dataset, Some(10)).unwrap();
                }
            });
        }
    });

    assert_eq!(recorder.counts(day, "radar").unwrap(), Counts { files: 400, bytes: 4_000 });
    assert_eq!(recorder.counts(day, "swob").unwrap(), Counts { files: 400, bytes: 4_000 });
    assert_eq!(recorder.counts(day, TOTAL_DATASET).unwrap(), Counts { files: 800, bytes: 8_000 });
}

#[test]
fn export_aggregates_days_and_purge_clears() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = MetricsRecorder::new(store.clone());
    let monday = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
    let tuesday = NaiveDate::from_ymd_opt(2024, 3, 12).unwrap();
    recorder
        .record_on(monday, "urn:wmo:md:ca-eccc-msc:model_gem_global", Some(10_485_760))
        .unwrap();
    recorder
        .record_on(tuesday, "urn:wmo:md:ca-eccc-msc:model_gem_global", Some(10_485_760))
        .unwrap();
    store.set("unrelated", b"1", None).unwrap();

    assert_eq!(
        metric_key(monday, "urn:wmo:md:ca-eccc-msc:model_gem_global", Metric::Files),
        "metrics_2024-03-11_urn:wmo:md:ca-eccc-msc:model-gem-global_files"
    );

    let pipeline = DispatchPipeline::new(config(), catalog(), Arc::new(InMemoryBroker::new()))
        .unwrap()
        .with_metrics(store.clone());
    let snapshot = pipeline.export_metrics().unwrap();
    let gem = &snapshot["model-gem-global"];
    assert_eq!(gem.files, 2);
    assert_eq!(gem.bytes, "20.0 MB");
    assert_eq!(gem.title.as_deref(), Some("GEM Global"));
    assert_eq!(gem.topic.as_deref(), Some("data/core/weather/model_gem_global"));

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["total"]["files"], 2);

    let purged = pipeline.purge_metrics().unwrap();
    assert_eq!(purged, snapshot);
    assert!(pipeline.export_metrics().unwrap().is_empty());
    assert_eq!(store.get("unrelated").unwrap(), Some(b"1".to_vec()));
}
