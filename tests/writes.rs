mod support;

use assert_matches::assert_matches;
use serde_json::json;

use esdb::{
    AppendOptions, Code, CurrentRevision, DeleteOptions, Error, EventData, ExpectedRevision,
    ReadOptions,
};
use support::{start, TestNode};

async fn seed(node: &TestNode, stream: &str, count: usize) {
    let events = (0..count)
        .map(|n| EventData::json("counted", &json!({ "n": n })).unwrap())
        .collect::<Vec<_>>();
    node.client
        .append(stream, events, AppendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn append_to_fresh_stream_then_read_back_in_order() {
    let node = start().await;

    let events: Vec<EventData> = (0..4)
        .map(|n| EventData::json("counted", &json!({ "n": n })).unwrap())
        .collect();
    let expected_payloads: Vec<_> = events.iter().map(|e| e.data.clone()).collect();

    let result = node
        .client
        .append(
            "fresh",
            events,
            AppendOptions::default().expect(ExpectedRevision::NoStream),
        )
        .await
        .unwrap();
    assert_eq!(result.current_revision, CurrentRevision::Current(3));
    assert!(result.position.is_some());

    let read = node
        .client
        .read_chunk("fresh", ReadOptions::default().max_count(10))
        .await
        .unwrap();
    assert_eq!(read.len(), 4);
    for (n, event) in read.iter().enumerate() {
        let recorded = event.get_original_event();
        assert_eq!(recorded.revision, n as u64);
        assert_eq!(recorded.event_type, "counted");
        assert!(recorded.is_json());
        assert_eq!(recorded.data, expected_payloads[n]);
    }
}

#[tokio::test]
async fn append_with_exists_expectation_extends_the_stream() {
    let node = start().await;
    seed(&node, "existing", 2).await;

    let event = EventData::json("grpc-client", &json!({ "runtime": "NodeJS" })).unwrap();
    let payload = event.data.clone();
    let result = node
        .client
        .append(
            "existing",
            vec![event],
            AppendOptions::default().expect(ExpectedRevision::StreamExists),
        )
        .await
        .unwrap();
    assert_eq!(result.current_revision, CurrentRevision::Current(2));

    let read = node
        .client
        .read_chunk("existing", ReadOptions::default().max_count(10))
        .await
        .unwrap();
    assert_eq!(read.len(), 3);
    let last = read.last().unwrap().get_original_event();
    assert_eq!(last.event_type, "grpc-client");
    assert_eq!(last.data, payload);
    assert_eq!(last.revision, 2);
}

#[tokio::test]
async fn no_stream_expectation_on_a_non_empty_stream_fails_and_changes_nothing() {
    let node = start().await;
    seed(&node, "occupied", 1).await;

    let event = EventData::json("ignored", &json!({})).unwrap();
    let result = node
        .client
        .append(
            "occupied",
            vec![event],
            AppendOptions::default().expect(ExpectedRevision::NoStream),
        )
        .await;

    assert_matches!(
        result,
        Err(Error::WrongExpectedRevision {
            expected: ExpectedRevision::NoStream,
            current: CurrentRevision::Current(0),
        })
    );
    assert_eq!(node.store.stream_len("occupied"), 1);
}

#[tokio::test]
async fn exact_revision_expectations() {
    let node = start().await;
    seed(&node, "exact", 2).await;

    let ok = node
        .client
        .append(
            "exact",
            vec![EventData::json("next", &json!({})).unwrap()],
            AppendOptions::default().expect(ExpectedRevision::Exact(1)),
        )
        .await;
    assert_matches!(ok, Ok(result) if result.current_revision == CurrentRevision::Current(2));

    let stale = node
        .client
        .append(
            "exact",
            vec![EventData::json("next", &json!({})).unwrap()],
            AppendOptions::default().expect(ExpectedRevision::Exact(0)),
        )
        .await;
    assert_matches!(
        stale,
        Err(Error::WrongExpectedRevision {
            expected: ExpectedRevision::Exact(0),
            current: CurrentRevision::Current(2),
        })
    );
}

#[tokio::test]
async fn append_after_tombstone_reports_the_stream_deleted() {
    let node = start().await;
    seed(&node, "doomed", 1).await;

    let deleted = node
        .client
        .delete("doomed", DeleteOptions::default().tombstone())
        .await
        .unwrap();
    assert!(deleted.is_some());

    let result = node
        .client
        .append(
            "doomed",
            vec![EventData::json("late", &json!({})).unwrap()],
            AppendOptions::default(),
        )
        .await;
    assert_matches!(
        result,
        Err(Error::Grpc(status)) if status.code == Code::FailedPrecondition
            && status.message == "Event stream 'doomed' is deleted."
    );
}

#[tokio::test]
async fn soft_deleted_streams_can_be_recreated() {
    let node = start().await;
    seed(&node, "phoenix", 2).await;

    node.client
        .delete("phoenix", DeleteOptions::default())
        .await
        .unwrap();

    node.client
        .append(
            "phoenix",
            vec![EventData::json("reborn", &json!({})).unwrap()],
            AppendOptions::default(),
        )
        .await
        .unwrap();

    let read = node
        .client
        .read_chunk("phoenix", ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].get_original_event().event_type, "reborn");
}

#[tokio::test]
async fn delete_with_failed_expectation_is_a_grpc_error() {
    let node = start().await;

    let result = node
        .client
        .delete(
            "nothing-here",
            DeleteOptions::default().expect(ExpectedRevision::Exact(5)),
        )
        .await;
    assert_matches!(result, Err(Error::Grpc(status)) if status.code == Code::FailedPrecondition);
}
