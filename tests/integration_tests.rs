//! Integration tests for the cinder engine.
//!
//! These exercise the write fan-out, materialized view lifecycle,
//! aggregating tables, and the loadable registry end to end.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use cinder::aggregate::{AggregateDescriptor, AggregateFunction};
use cinder::block::{Block, BlocksStream, SendableBlockStream};
use cinder::catalog::{Storage, TableLock};
use cinder::copy::copy_blocks;
use cinder::dictionary::create_dictionary_from_config;
use cinder::registry::{
    Config, ConfigSettings, FileConfigRepository, Lifetime, Loadable, LoadableRegistry,
    UpdateSettings,
};
use cinder::sink::{BoxedSink, Sink};
use cinder::storage::{
    AggregationQuery, CreateViewParams, MemoryTable, ViewDefinition, ViewTarget,
};
use cinder::transform::{IdentityTransform, ProjectionTransform};
use cinder::{CinderError, Engine, PushingToViewsSink, Result, StorageId};

fn events_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("city", DataType::Utf8, false),
        Field::new("amount", DataType::Int64, false),
    ]))
}

fn events_batch(cities: Vec<&str>, amounts: Vec<i64>) -> RecordBatch {
    RecordBatch::try_new(
        events_schema(),
        vec![
            Arc::new(StringArray::from(cities)),
            Arc::new(Int64Array::from(amounts)),
        ],
    )
    .unwrap()
}

fn total_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

/// A storage whose sink records every call, for observing frame
/// boundaries across the fan-out.
#[derive(Debug)]
struct RecordingStorage {
    id: parking_lot::RwLock<StorageId>,
    schema: SchemaRef,
    events: Arc<Mutex<Vec<String>>>,
    lock: TableLock,
}

impl RecordingStorage {
    fn new(id: StorageId, schema: SchemaRef) -> Self {
        Self {
            id: parking_lot::RwLock::new(id),
            schema,
            events: Arc::new(Mutex::new(Vec::new())),
            lock: TableLock::new(),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Storage for RecordingStorage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn storage_id(&self) -> StorageId {
        self.id.read().clone()
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_lock(&self) -> &TableLock {
        &self.lock
    }

    fn read(&self, _projection: Option<&[usize]>) -> Result<SendableBlockStream> {
        Ok(Box::new(BlocksStream::one_frame(Vec::new())))
    }

    fn write(&self) -> Result<BoxedSink> {
        Ok(Box::new(RecordingSink {
            events: self.events.clone(),
        }))
    }

    fn rename_in_memory(&self, new_id: StorageId) -> Result<()> {
        *self.id.write() = new_id;
        Ok(())
    }
}

struct RecordingSink {
    events: Arc<Mutex<Vec<String>>>,
}

impl Sink for RecordingSink {
    fn set_sample_block(&mut self, _batch: &RecordBatch) -> Result<()> {
        self.events.lock().push("sample".to_string());
        Ok(())
    }

    fn write_prefix(&mut self) -> Result<()> {
        self.events.lock().push("prefix".to_string());
        Ok(())
    }

    fn write(&mut self, block: &Block) -> Result<()> {
        self.events.lock().push(format!("write:{}", block.num_rows()));
        Ok(())
    }

    fn write_suffix(&mut self) -> Result<()> {
        self.events.lock().push("suffix".to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out frame semantics
// ---------------------------------------------------------------------------

#[test]
fn test_empty_insert_reaches_table_and_view_as_one_empty_frame() {
    let engine = Engine::new();
    let catalog = engine.catalog();

    let base = Arc::new(RecordingStorage::new(
        StorageId::new("default", "base"),
        events_schema(),
    ));
    let dependent = Arc::new(RecordingStorage::new(
        StorageId::new("default", "dependent"),
        events_schema(),
    ));
    catalog.register_table(base.clone()).unwrap();
    catalog.register_table(dependent.clone()).unwrap();
    catalog.add_dependency(base.storage_id(), dependent.storage_id());

    // No blocks at all: the copier synthesizes one empty frame.
    engine
        .insert_into(&StorageId::new("default", "base"), vec![])
        .unwrap();

    assert_eq!(base.events(), vec!["prefix", "suffix"]);
    assert_eq!(dependent.events(), vec!["prefix", "suffix"]);
}

#[test]
fn test_two_block_frame_preserves_order_through_fan_out() {
    let engine = Engine::new();
    let catalog = engine.catalog();

    let base = Arc::new(RecordingStorage::new(
        StorageId::new("default", "base"),
        events_schema(),
    ));
    catalog.register_table(base.clone()).unwrap();

    let blocks = vec![
        Block::new(events_batch(vec!["ams", "ber"], vec![1, 2]), true, false),
        Block::new(events_batch(vec!["ams", "ber", "ams"], vec![3, 4, 5]), false, true),
    ];
    let mut source = BlocksStream::from_blocks(blocks);
    let mut sink =
        PushingToViewsSink::new(catalog, &StorageId::new("default", "base"), false).unwrap();
    copy_blocks(&mut source, &mut sink, None).unwrap();

    assert_eq!(
        base.events(),
        vec!["sample", "prefix", "write:2", "write:3", "suffix"]
    );
}

#[test]
fn test_two_disjoint_frames_produce_two_boundary_pairs() {
    let engine = Engine::new();
    let catalog = engine.catalog();

    let base = Arc::new(RecordingStorage::new(
        StorageId::new("default", "base"),
        events_schema(),
    ));
    catalog.register_table(base.clone()).unwrap();

    let blocks = vec![
        Block::single_frame(events_batch(vec!["ams"], vec![1])),
        Block::single_frame(events_batch(vec!["ber"], vec![2])),
    ];
    let mut source = BlocksStream::from_blocks(blocks);
    let mut sink =
        PushingToViewsSink::new(catalog, &StorageId::new("default", "base"), false).unwrap();
    copy_blocks(&mut source, &mut sink, None).unwrap();

    assert_eq!(
        base.events(),
        vec![
            "sample", "prefix", "write:1", "suffix", "sample", "prefix", "write:1", "suffix"
        ]
    );
}

// ---------------------------------------------------------------------------
// Incremental propagation into views and aggregating tables
// ---------------------------------------------------------------------------

#[test]
fn test_insert_propagates_into_materialized_view() {
    let engine = Engine::new();
    let source_id = StorageId::new("default", "events");
    engine.create_table(source_id.clone(), events_schema()).unwrap();

    let view_schema = Arc::new(Schema::new(vec![Field::new("city", DataType::Utf8, false)]));
    engine
        .create_materialized_view(CreateViewParams {
            id: StorageId::new("default", "cities"),
            schema: view_schema,
            definition: ViewDefinition::new(
                source_id.clone(),
                Arc::new(ProjectionTransform::new(vec!["city".to_string()])),
            ),
            target: ViewTarget::Inner { attach: false },
            periodic_refresh: None,
        })
        .unwrap();

    engine
        .insert_into(&source_id, vec![events_batch(vec!["ams", "ber"], vec![1, 2])])
        .unwrap();

    let source_rows = engine.read_table(&source_id).unwrap();
    assert_eq!(total_rows(&source_rows), 2);

    let view_rows = engine
        .read_table(&StorageId::new("default", "cities"))
        .unwrap();
    assert_eq!(total_rows(&view_rows), 2);
    assert_eq!(view_rows[0].num_columns(), 1);
}

#[test]
fn test_insert_feeds_dependent_aggregating_table() {
    let engine = Engine::new();
    let source_id = StorageId::new("default", "events");
    engine.create_table(source_id.clone(), events_schema()).unwrap();

    let agg_id = StorageId::new("default", "events_by_city");
    engine
        .create_aggregating_table(
            agg_id.clone(),
            AggregationQuery::new(
                source_id.clone(),
                vec!["city"],
                vec![AggregateDescriptor::new(
                    AggregateFunction::Sum,
                    Some("amount"),
                    "total",
                )],
            ),
        )
        .unwrap();
    engine.catalog().add_dependency(source_id.clone(), agg_id.clone());

    engine
        .insert_into(
            &source_id,
            vec![events_batch(vec!["ams", "ber", "ams"], vec![1, 2, 3])],
        )
        .unwrap();
    engine
        .insert_into(&source_id, vec![events_batch(vec!["ber"], vec![10])])
        .unwrap();

    let batches = engine.read_table(&agg_id).unwrap();
    assert_eq!(total_rows(&batches), 2);

    let keys = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap();
    let totals = batches[0]
        .column(1)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    for i in 0..2 {
        match keys.value(i) {
            "ams" => assert_eq!(totals.value(i), 4.0),
            "ber" => assert_eq!(totals.value(i), 12.0),
            other => panic!("unexpected group {}", other),
        }
    }
}

#[test]
fn test_chained_views_propagate_transitively() {
    // events -> mv_cities (projection) whose inner table feeds mv_copy.
    let engine = Engine::new();
    let source_id = StorageId::new("default", "events");
    engine.create_table(source_id.clone(), events_schema()).unwrap();

    let city_schema: SchemaRef =
        Arc::new(Schema::new(vec![Field::new("city", DataType::Utf8, false)]));

    let first = engine
        .create_materialized_view(CreateViewParams {
            id: StorageId::new("default", "mv_cities"),
            schema: city_schema.clone(),
            definition: ViewDefinition::new(
                source_id.clone(),
                Arc::new(ProjectionTransform::new(vec!["city".to_string()])),
            ),
            target: ViewTarget::Inner { attach: false },
            periodic_refresh: None,
        })
        .unwrap();

    engine
        .create_materialized_view(CreateViewParams {
            id: StorageId::new("default", "mv_copy"),
            schema: city_schema,
            definition: ViewDefinition::new(
                first.target_table_id(),
                Arc::new(IdentityTransform),
            ),
            target: ViewTarget::Inner { attach: false },
            periodic_refresh: None,
        })
        .unwrap();

    engine
        .insert_into(&source_id, vec![events_batch(vec!["ams"], vec![1])])
        .unwrap();

    let copied = engine
        .read_table(&StorageId::new("default", "mv_copy"))
        .unwrap();
    assert_eq!(total_rows(&copied), 1);
}

// ---------------------------------------------------------------------------
// Materialized view refresh
// ---------------------------------------------------------------------------

#[test]
fn test_on_demand_refresh_rebuilds_from_source() {
    let engine = Engine::new();
    let source_id = StorageId::new("default", "events");
    let source = engine.create_table(source_id.clone(), events_schema()).unwrap();

    let view = engine
        .create_materialized_view(CreateViewParams {
            id: StorageId::new("default", "mv"),
            schema: events_schema(),
            definition: ViewDefinition::new(source_id.clone(), Arc::new(IdentityTransform)),
            target: ViewTarget::Inner { attach: false },
            periodic_refresh: None,
        })
        .unwrap();

    // Rows that predate the view never flowed through the fan-out.
    let mut sink = source.write().unwrap();
    sink.write_prefix().unwrap();
    sink.write(&Block::single_frame(events_batch(
        vec!["ams", "ber"],
        vec![1, 2],
    )))
    .unwrap();
    sink.write_suffix().unwrap();

    assert_eq!(
        total_rows(&engine.read_table(&StorageId::new("default", "mv")).unwrap()),
        0
    );

    view.refresh().unwrap();

    assert_eq!(
        total_rows(&engine.read_table(&StorageId::new("default", "mv")).unwrap()),
        2
    );
}

#[test]
fn test_periodic_refresh_follows_source() {
    let engine = Engine::new();
    let source_id = StorageId::new("default", "events");
    let source = engine.create_table(source_id.clone(), events_schema()).unwrap();

    // Five rows exist before the view is created.
    let mut sink = source.write().unwrap();
    sink.write_prefix().unwrap();
    sink.write(&Block::single_frame(events_batch(
        vec!["a", "b", "c", "d", "e"],
        vec![1, 2, 3, 4, 5],
    )))
    .unwrap();
    sink.write_suffix().unwrap();

    engine
        .create_materialized_view(CreateViewParams {
            id: StorageId::new("default", "mv"),
            schema: events_schema(),
            definition: ViewDefinition::new(source_id.clone(), Arc::new(IdentityTransform)),
            target: ViewTarget::Inner { attach: false },
            periodic_refresh: Some(Duration::from_secs(1)),
        })
        .unwrap();

    // The startup refresh plus one period must have landed by now.
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(
        total_rows(&engine.read_table(&StorageId::new("default", "mv")).unwrap()),
        5
    );

    source.truncate().unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(
        total_rows(&engine.read_table(&StorageId::new("default", "mv")).unwrap()),
        0
    );
}

// ---------------------------------------------------------------------------
// Loadable registry
// ---------------------------------------------------------------------------

/// A loadable whose construction fails until told otherwise.
#[derive(Debug)]
struct FlakySource {
    name: String,
    fail: Arc<AtomicBool>,
}

impl Loadable for FlakySource {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lifetime(&self) -> Lifetime {
        Lifetime::new(0, 0)
    }

    fn supports_updates(&self) -> bool {
        false
    }

    fn is_modified(&self) -> bool {
        false
    }

    fn clone_loadable(&self) -> Result<Arc<dyn Loadable>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CinderError::construction("source is down"));
        }
        Ok(Arc::new(FlakySource {
            name: self.name.clone(),
            fail: self.fail.clone(),
        }))
    }
}

fn flaky_registry(dir: &std::path::Path, fail: Arc<AtomicBool>) -> LoadableRegistry {
    std::fs::write(
        dir.join("objects.json"),
        r#"{"object": {"name": "feed"}}"#,
    )
    .unwrap();
    let main = Config::parse(&format!(
        r#"{{"objects_config": "{}"}}"#,
        dir.join("objects.json").display()
    ))
    .unwrap();

    LoadableRegistry::new(
        main,
        UpdateSettings {
            check_period_sec: 1,
            backoff_initial_sec: 1,
            backoff_max_sec: 60,
        },
        ConfigSettings {
            external_config: "object".to_string(),
            external_name: "name".to_string(),
            path_setting_name: "objects_config".to_string(),
        },
        Box::new(FileConfigRepository::new()),
        "object",
        Box::new(move |name, _config, _key| {
            if fail.load(Ordering::SeqCst) {
                return Err(CinderError::construction("source is down"));
            }
            Ok(Arc::new(FlakySource {
                name: name.to_string(),
                fail: fail.clone(),
            }) as Arc<dyn Loadable>)
        }),
    )
}

#[test]
fn test_registry_backoff_counts_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let fail = Arc::new(AtomicBool::new(true));
    let registry = flaky_registry(dir.path(), fail.clone());

    // Initial scan captures the failure with a first retry armed.
    registry.reload_and_update(false).ok();
    assert!(registry.get("feed").is_err());

    // Three failing cycles: error_count climbs 1, 2, 3 and every retry
    // delay stays within [backoff_initial, backoff_max].
    for expected in 1..=3u32 {
        loop {
            let (_, next_attempt) = registry.failure_info("feed").unwrap();
            if Instant::now() >= next_attempt {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        registry.reload_and_update(false).ok();

        let (error_count, next_attempt) = registry.failure_info("feed").unwrap();
        assert_eq!(error_count, expected);
        let delay = next_attempt - Instant::now();
        assert!(delay <= Duration::from_secs(60));
    }

    // A healthy cycle clears the failure set and the object appears.
    fail.store(false, Ordering::SeqCst);
    loop {
        let Some((_, next_attempt)) = registry.failure_info("feed") else {
            break;
        };
        if Instant::now() >= next_attempt {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    registry.reload_and_update(false).unwrap();

    assert!(registry.failure_info("feed").is_none());
    assert!(registry.get("feed").is_ok());
}

#[test]
fn test_registry_provenances_never_share_a_name() {
    let dir = tempfile::tempdir().unwrap();
    let fail = Arc::new(AtomicBool::new(false));
    let registry = flaky_registry(dir.path(), fail.clone());

    // The config file declares "db.feed", colliding with the catalog name.
    std::fs::write(
        dir.path().join("objects.json"),
        r#"{"object": {"name": "db.feed"}}"#,
    )
    .unwrap();

    registry
        .add_from_catalog(
            "db",
            "feed",
            Arc::new(FlakySource {
                name: "db.feed".to_string(),
                fail,
            }),
        )
        .unwrap();

    assert!(registry.reload_and_update(true).is_err());
    assert!(registry.try_get("db.feed").is_none());
    assert!(registry.get_from_catalog("db", "feed").is_ok());
}

// ---------------------------------------------------------------------------
// Dictionaries
// ---------------------------------------------------------------------------

fn dictionary_config(structure: &str) -> String {
    format!(
        r#"{{
            "dictionary": {{
                "name": "d",
                "layout": {{"flat": {{}}}},
                "lifetime": {{"min": 0, "max": 0}},
                "source": {{"inline": {{"rows": []}}}},
                "structure": {structure}
            }}
        }}"#
    )
}

#[test]
fn test_dictionary_validation_errors() {
    // Both id and key.
    let config = Config::parse(&dictionary_config(
        r#"{
            "id": {"name": "x"},
            "key": {"attribute": [{"name": "k", "type": "String"}]},
            "attribute": [{"name": "a", "type": "UInt8", "null_value": "0"}]
        }"#,
    ))
    .unwrap();
    let err = create_dictionary_from_config("d", &config, "dictionary").unwrap_err();
    assert!(matches!(err, CinderError::Config { .. }));

    // Mismatched range bound types.
    let config = Config::parse(&dictionary_config(
        r#"{
            "id": {"name": "x"},
            "range_min": {"name": "start", "type": "Date"},
            "range_max": {"name": "end", "type": "DateTime"},
            "attribute": [{"name": "a", "type": "UInt8", "null_value": "0"}]
        }"#,
    ))
    .unwrap();
    let err = create_dictionary_from_config("d", &config, "dictionary").unwrap_err();
    assert!(matches!(err, CinderError::Type { .. }));

    // Two hierarchical attributes.
    let config = Config::parse(&dictionary_config(
        r#"{
            "id": {"name": "x"},
            "attribute": [
                {"name": "a", "type": "UInt64", "null_value": "0", "hierarchical": true},
                {"name": "b", "type": "UInt64", "null_value": "0", "hierarchical": true}
            ]
        }"#,
    ))
    .unwrap();
    let err = create_dictionary_from_config("d", &config, "dictionary").unwrap_err();
    assert!(matches!(err, CinderError::Config { .. }));
}

#[test]
fn test_dictionary_reload_through_registry_thread() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("dictionaries.json"),
        dictionary_config(
            r#"{
                "id": {"name": "id"},
                "attribute": [{"name": "label", "type": "String", "null_value": ""}]
            }"#,
        ),
    )
    .unwrap();

    let main = Config::parse(&format!(
        r#"{{"dictionaries_config": "{}"}}"#,
        dir.path().join("dictionaries.json").display()
    ))
    .unwrap();

    let registry = LoadableRegistry::new(
        main,
        UpdateSettings {
            check_period_sec: 1,
            backoff_initial_sec: 1,
            backoff_max_sec: 10,
        },
        ConfigSettings {
            external_config: "dictionary".to_string(),
            external_name: "name".to_string(),
            path_setting_name: "dictionaries_config".to_string(),
        },
        Box::new(FileConfigRepository::new()),
        "dictionary",
        Box::new(create_dictionary_from_config),
    );

    registry.init(true).unwrap();
    assert!(registry.get("d").is_ok());
    registry.shutdown();
}

// ---------------------------------------------------------------------------
// Refresh atomicity
// ---------------------------------------------------------------------------

#[test]
fn test_readers_never_observe_the_shadow_table() {
    let engine = Engine::new();
    let source_id = StorageId::new("default", "events");
    let source = engine.create_table(source_id.clone(), events_schema()).unwrap();

    let mut sink = source.write().unwrap();
    sink.write_prefix().unwrap();
    sink.write(&Block::single_frame(events_batch(vec!["ams"], vec![1])))
        .unwrap();
    sink.write_suffix().unwrap();

    let view = engine
        .create_materialized_view(CreateViewParams {
            id: StorageId::new("default", "mv"),
            schema: events_schema(),
            definition: ViewDefinition::new(source_id, Arc::new(IdentityTransform)),
            target: ViewTarget::Inner { attach: false },
            periodic_refresh: None,
        })
        .unwrap();
    view.refresh().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader_errors = Arc::new(AtomicU32::new(0));

    let reader_view = view.clone();
    let reader_stop = stop.clone();
    let reader_seen = reader_errors.clone();
    let reader = std::thread::spawn(move || {
        while !reader_stop.load(Ordering::SeqCst) {
            // Resolving through the view must always land on a live
            // target; a reader seeing the shadow mid-swap would error.
            match reader_view.read(None) {
                Ok(mut stream) => {
                    while let Ok(Some(block)) = stream.read() {
                        if block.num_rows() != 1 {
                            reader_seen.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                Err(_) => {
                    reader_seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    });

    for _ in 0..20 {
        view.refresh().unwrap();
    }

    stop.store(true, Ordering::SeqCst);
    reader.join().unwrap();
    assert_eq!(reader_errors.load(Ordering::SeqCst), 0);
}
