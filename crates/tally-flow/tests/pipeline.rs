//! End-to-end pipeline tests against in-memory stores and sink.

use std::sync::Arc;

use serde_json::{json, Value};

use tally_core::id::{pad16, tkuri};
use tally_core::partition::{epoch, Destination};
use tally_flow::config::{
    Config, ErrorConfig, InputConfig, OutputConfig, PipelineConfig, SinkConfig, TimesFn,
};
use tally_flow::doc::Doc;
use tally_flow::error::{Error, MONTH_MS};
use tally_flow::pipeline::Pipeline;
use tally_flow::reduce::now_ms;
use tally_flow::replay::{ReplayDriver, ReplayStats};
use tally_flow::sink::{MemorySink, SinkResponse, SinkTransport};
use tally_flow::store::partitioned::{MemoryProvider, StoreProvider};

const T: i64 = 1_700_000_000_000;

fn org_of(doc: &Doc) -> String {
    doc.get("org")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn time_of_payload(doc: &Doc) -> i64 {
    doc.get("t").and_then(Value::as_i64).unwrap_or(0)
}

/// A metering app: sums `usage` per organization.
fn metering_config(otimes: TimesFn) -> PipelineConfig {
    PipelineConfig {
        input: InputConfig {
            doc_type: "usage".into(),
            key: Arc::new(|doc, _auth| org_of(doc)),
            time: Arc::new(time_of_payload),
            groups: Arc::new(|doc| vec![org_of(doc)]),
            dedupe: true,
        },
        output: OutputConfig {
            doc_type: "accumulated".into(),
            keys: Arc::new(|doc| vec![org_of(doc)]),
            times: otimes,
        },
        sink: SinkConfig {
            host: Some("http://collector".into()),
            posts: vec!["/v1/collected".into()],
            keys: None,
            times: None,
            authentication: None,
        },
        error: ErrorConfig::default(),
        reducer: Arc::new(|accums, udoc| {
            let prior = accums
                .first()
                .and_then(|a| a.get("total"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let usage = udoc.get("usage").and_then(Value::as_i64).unwrap_or(0);
            Ok(vec![json!({ "total": prior + usage })])
        }),
    }
}

/// Output time equals the input time (one output per input).
fn identity_times() -> TimesFn {
    Arc::new(|doc| vec![time_of_payload(doc)])
}

/// Output time is a fixed bucket (accumulator shared across inputs).
fn bucketed_times(bucket: i64) -> TimesFn {
    Arc::new(move |_doc| vec![bucket])
}

struct Fixture {
    pipeline: Pipeline,
    sink: Arc<MemorySink>,
    provider: Arc<MemoryProvider>,
}

fn fixture(otimes: TimesFn, env: Config) -> Fixture {
    let sink = Arc::new(MemorySink::new());
    let provider = Arc::new(MemoryProvider::new());
    let pipeline = Pipeline::builder(metering_config(otimes), env)
        .with_provider(Arc::clone(&provider) as Arc<dyn StoreProvider>)
        .with_transport(Arc::clone(&sink) as Arc<dyn SinkTransport>)
        .build()
        .expect("pipeline builds");
    Fixture {
        pipeline,
        sink,
        provider,
    }
}

fn usage(org: &str, usage: i64, t: i64) -> Doc {
    Doc::from_value(json!({ "usage": usage, "org": org, "t": t })).unwrap()
}

#[tokio::test]
async fn happy_reduce_logs_input_output_and_posts_to_sink() {
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));

    let stamped = f.pipeline.play(usage("o1", 1, T), None).await.unwrap();
    assert_eq!(stamped.id(), Some(tkuri("o1", T).as_str()));
    assert_eq!(stamped.processed(), Some(T));
    assert_eq!(stamped.processed_id(), Some(pad16(T).as_str()));

    // The input is durable at its time-major id.
    let logged = f.pipeline.get_input("o1", T).await.unwrap();
    assert_eq!(logged.get("usage"), Some(&json!(1)));

    // The output is durable at its key-major id with the back-reference.
    let output = f.pipeline.get_output("o1", T).await.unwrap();
    assert_eq!(output.get("total"), Some(&json!(1)));
    assert_eq!(output.get("usage_id"), Some(&json!(tkuri("o1", T))));
    assert!(output.processed().is_some());
    assert!(output.rev().is_some());

    // The sink got the output without its revision.
    let posts = f.sink.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "http://collector/v1/collected");
    assert!(posts[0].1.get("rev").is_none());
    assert_eq!(posts[0].1.get("total"), Some(&json!(1)));
}

#[tokio::test]
async fn duplicate_submission_maps_to_conflict_without_error_doc() {
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));

    f.pipeline.play(usage("o1", 1, T), None).await.unwrap();
    let err = f.pipeline.play(usage("o1", 1, T), None).await.unwrap_err();
    assert!(matches!(err, Error::Duplicate { .. }));
    assert_eq!(err.status(), 409);

    // A duplicate is not a failure: no error document is written.
    let errors = f.pipeline.get_errors(T - 1000, T + 1000).await.unwrap();
    assert!(errors.is_empty());

    // The single durable effect stands.
    let output = f.pipeline.get_output("o1", T).await.unwrap();
    assert_eq!(output.get("total"), Some(&json!(1)));
}

#[tokio::test]
async fn sink_outage_writes_error_doc_and_no_output() {
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));
    for _ in 0..5 {
        f.sink.respond_with(SinkResponse::status(502));
    }

    let err = f.pipeline.play(usage("o1", 1, T), None).await.unwrap_err();
    assert_eq!(err.status(), 502);
    assert_eq!(err.label(), "esink");
    assert_eq!(f.sink.posts().len(), 5);

    // No output was logged.
    assert!(matches!(
        f.pipeline.get_output("o1", T).await,
        Err(Error::NotFound { .. })
    ));

    // The failure is durable in the error store, input id preserved.
    let errors = f.pipeline.get_errors(T - 1000, T + 1000).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get("error"), Some(&json!("esink")));
    assert_eq!(errors[0].get("input_id"), Some(&json!(tkuri("o1", T))));
    assert_eq!(errors[0].id(), Some(tkuri("o1", T).as_str()));
}

#[tokio::test]
async fn accumulator_updates_in_place_with_prior_revision() {
    let f = fixture(bucketed_times(T), Config::with_db_uri("mem://test"));

    f.pipeline.play(usage("o1", 1, T), None).await.unwrap();
    let first = f.pipeline.get_output("o1", T).await.unwrap();
    assert_eq!(first.get("total"), Some(&json!(1)));
    assert_eq!(first.rev(), Some("1"));

    // A later input for the same (okey, otime) folds onto the accumulator.
    f.pipeline.play(usage("o1", 2, T + 5000), None).await.unwrap();
    let second = f.pipeline.get_output("o1", T).await.unwrap();
    assert_eq!(second.get("total"), Some(&json!(3)));
    assert_eq!(second.rev(), Some("2"));
    assert_eq!(second.get("usage_id"), Some(&json!(tkuri("o1", T + 5000))));
}

#[tokio::test]
async fn batched_calls_fold_within_one_group() {
    let f = fixture(bucketed_times(T), Config::with_db_uri("mem://test"));

    let results = f
        .pipeline
        .play_all(
            vec![usage("o1", 1, T), usage("o1", 2, T + 1), usage("o2", 7, T + 2)],
            None,
        )
        .await;
    assert!(results.iter().all(std::result::Result::is_ok));

    // Both o1 inputs folded into one accumulator write.
    let o1 = f.pipeline.get_output("o1", T).await.unwrap();
    assert_eq!(o1.get("total"), Some(&json!(3)));
    assert_eq!(o1.rev(), Some("1"));

    let o2 = f.pipeline.get_output("o2", T).await.unwrap();
    assert_eq!(o2.get("total"), Some(&json!(7)));

    // Every call still posted its own outputs.
    assert_eq!(f.sink.posts().len(), 3);
}

#[tokio::test]
async fn reducer_error_mark_fails_the_call_and_skips_the_sink() {
    let mut config = metering_config(identity_times());
    config.reducer = Arc::new(|_accums, _udoc| {
        Ok(vec![json!({ "error": "emeter", "reason": "no meter for plan" })])
    });
    let sink = Arc::new(MemorySink::new());
    let pipeline = Pipeline::builder(config, Config::with_db_uri("mem://test"))
        .with_transport(Arc::clone(&sink) as Arc<dyn SinkTransport>)
        .build()
        .unwrap();

    let err = pipeline.play(usage("o1", 1, T), None).await.unwrap_err();
    assert_eq!(err.label(), "ereduce");

    // Skipped at the sink and at the output log; durable in the error store.
    assert!(sink.posts().is_empty());
    assert!(matches!(
        pipeline.get_output("o1", T).await,
        Err(Error::NotFound { .. })
    ));
    let errors = pipeline.get_errors(T - 1000, T + 1000).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get("error"), Some(&json!("emeter")));
}

#[tokio::test]
async fn replay_resubmits_inputs_without_output_or_error() {
    let now = now_ms();
    let t1 = now - 10_000;
    let t2 = now - 5_000;
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));

    // First input went through the whole pipeline.
    f.pipeline.play(usage("o1", 1, t1), None).await.unwrap();

    // Second input was only logged: the process died before reducing.
    // Write it straight into the input partition the pipeline uses.
    let mut orphan = usage("o2", 4, t2);
    orphan.set_id(tkuri("o2", t2));
    orphan.set_processed(t2);
    let input_partition = f
        .provider
        .open(
            "inputs",
            Destination {
                partition: 0,
                epoch: epoch(t2).unwrap(),
            },
        )
        .await
        .unwrap();
    input_partition.put(&orphan).await.unwrap();

    let stats = ReplayDriver::new(3_600_000, 200)
        .run(&f.pipeline)
        .await
        .unwrap();
    assert_eq!(
        stats,
        ReplayStats {
            replayed: 1,
            failed: 0
        }
    );

    // The orphan now has its output; the processed input was untouched.
    let replayed = f.pipeline.get_output("o2", t2).await.unwrap();
    assert_eq!(replayed.get("total"), Some(&json!(4)));
    let existing = f.pipeline.get_output("o1", t1).await.unwrap();
    assert_eq!(existing.get("total"), Some(&json!(1)));

    // A second run finds nothing to do.
    let stats = ReplayDriver::new(3_600_000, 200)
        .run(&f.pipeline)
        .await
        .unwrap();
    assert_eq!(stats, ReplayStats::default());
}

#[tokio::test]
async fn error_window_boundary() {
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));

    // Exactly one month is accepted.
    assert!(f.pipeline.get_errors(T, T + MONTH_MS).await.is_ok());

    // One millisecond beyond is rejected as errlimit.
    let err = f
        .pipeline
        .get_errors(T, T + MONTH_MS + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WindowLimit { .. }));
    assert_eq!(err.status(), 409);
    assert_eq!(err.label(), "errlimit");
}

#[tokio::test]
async fn missing_db_configuration_fails_construction() {
    let mut env = Config::with_db_uri("");
    env.db_uri = String::new();
    let err = Pipeline::builder(metering_config(identity_times()), env)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("Missing DB configuration"));
}

#[tokio::test]
async fn delete_error_is_audited_and_404s_when_absent() {
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));
    for _ in 0..5 {
        f.sink.respond_with(SinkResponse::status(502));
    }
    f.pipeline.play(usage("o1", 1, T), None).await.unwrap_err();

    f.pipeline
        .delete_error("o1", T, "ops@example.com")
        .await
        .unwrap();
    assert!(matches!(
        f.pipeline.delete_error("o1", T, "ops@example.com").await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn slack_conflict_from_sink_is_a_real_failure() {
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));
    f.sink
        .respond_with(SinkResponse::with_body(409, json!({"error": "slack"})));

    let err = f.pipeline.play(usage("o1", 1, T), None).await.unwrap_err();
    assert_eq!(err.label(), "esink");

    // The output was not logged.
    assert!(matches!(
        f.pipeline.get_output("o1", T).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn benign_sink_conflict_counts_as_delivered() {
    let f = fixture(identity_times(), Config::with_db_uri("mem://test"));
    f.sink.respond_with(SinkResponse::status(409));

    f.pipeline.play(usage("o1", 1, T), None).await.unwrap();
    let output = f.pipeline.get_output("o1", T).await.unwrap();
    assert_eq!(output.get("total"), Some(&json!(1)));
}
