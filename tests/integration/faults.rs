use crate::*;

use pulse_core::wire::{EncodeOptions, FragmentCodec};
use pulse_services::{FrameSender, NewQuery};

/// Drain one node's scheduler without letting anyone else tick.
async fn drain(mesh: &Mesh, i: usize) -> usize {
    let mut sent = 0;
    while let TickOutcome::Sent { .. } = mesh.node(i).tick().await.unwrap() {
        sent += 1;
    }
    sent
}

#[tokio::test]
async fn test_lost_fragments_leave_partial_until_evicted() {
    let mesh = mesh(&[("phone-a", false), ("phone-b", false)]);
    mesh.medium.drop_every(Some(2));

    mesh.node(0)
        .send_query(NewQuery::assistant("is the bridge passable"))
        .await
        .unwrap();
    let sent = mesh.settle().await.unwrap();
    assert!(sent > 2, "query should span several frames");

    let b = mesh.status(1).await;
    assert_eq!(b.partial_messages, 1);
    assert_eq!(b.queued_messages, 0, "nothing complete, nothing to relay");

    // not old enough yet
    mesh.clock.advance(Duration::from_secs(60));
    mesh.node(1).tick().await.unwrap();
    assert_eq!(mesh.status(1).await.partial_messages, 1);

    mesh.clock.advance(Duration::from_secs(61));
    mesh.node(1).tick().await.unwrap();
    assert_eq!(mesh.status(1).await.partial_messages, 0);

    // the asker keeps waiting; the mesh gives no delivery guarantee
    assert_eq!(mesh.status(0).await.pending_queries, 1);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_duplicated_frames_do_not_duplicate_work() {
    let mut mesh = mesh(&[("phone-a", false), ("phone-b", false), ("gateway-c", true)]);
    mesh.cut(0, 2);
    mesh.medium.set_duplicate(true);

    let query_id = mesh
        .node(0)
        .send_query(NewQuery::assistant("fuel"))
        .await
        .unwrap();
    mesh.settle().await.unwrap();

    assert_eq!(
        mesh.responses(0),
        vec![(query_id, MemoryBackend::answer_for("fuel"))]
    );
    assert_eq!(mesh.devices[2].backend.queries().len(), 1);
    for i in 0..3 {
        assert_eq!(mesh.status(i).await.partial_messages, 0);
    }
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_reordered_and_interleaved_frames_reassemble() {
    let mut mesh = mesh(&[("phone-a", false), ("gateway-b", true)]);

    let first = mesh
        .node(0)
        .send_query(NewQuery::assistant("first question"))
        .await
        .unwrap();
    let second = mesh
        .node(0)
        .send_query(NewQuery::assistant("second, somewhat longer question"))
        .await
        .unwrap();

    mesh.medium.hold();
    let sent = drain(&mesh, 0).await;
    assert!(sent > 2);
    mesh.medium.release(|frames| frames.reverse());
    mesh.settle().await.unwrap();

    let mut responses = mesh.responses(0);
    responses.sort();
    let mut expected = vec![
        (first, MemoryBackend::answer_for("first question")),
        (
            second,
            MemoryBackend::answer_for("second, somewhat longer question"),
        ),
    ];
    expected.sort();
    assert_eq!(responses, expected);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_failed_sends_keep_frames_queued() {
    let mesh = mesh(&[("phone-a", false), ("phone-b", false)]);

    mesh.node(0)
        .send_query(NewQuery::assistant("signal?"))
        .await
        .unwrap();
    let queued = mesh.status(0).await.queued_frames;
    assert!(queued > 0);

    mesh.medium.set_send_fails(true);
    for _ in 0..3 {
        assert!(matches!(
            mesh.node(0).tick().await.unwrap(),
            TickOutcome::SendFailed { .. }
        ));
    }
    assert_eq!(mesh.status(0).await.queued_frames, queued);

    mesh.medium.set_send_fails(false);
    mesh.settle().await.unwrap();
    assert_eq!(
        mesh.medium.sent_by(&mesh.devices[0].endpoint),
        queued as u64
    );
    assert_eq!(mesh.status(1).await.partial_messages, 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_garbage_on_the_medium_is_ignored() {
    let mut mesh = mesh(&[("phone-a", false), ("gateway-b", true)]);
    let noise = mesh.medium.endpoint();

    // too short to be a frame
    noise.send(b"\x01\x00").unwrap();
    // well-formed frames around an unreadable payload
    let codec = FragmentCodec::new(16).unwrap();
    let junk = codec
        .encode(b"\x01{not json at all", EncodeOptions::default())
        .unwrap();
    for frame in &junk.frames {
        noise.send(frame).unwrap();
    }
    // payload version nobody speaks
    let future = codec
        .encode(b"\x09{}", EncodeOptions::default())
        .unwrap();
    for frame in &future.frames {
        noise.send(frame).unwrap();
    }

    let b = mesh.status(1).await;
    assert_eq!(b.partial_messages, 0);
    assert_eq!(b.queued_messages, 0);
    assert!(mesh.devices[1].backend.queries().is_empty());

    // and the node still works afterwards
    let query_id = mesh
        .node(0)
        .send_query(NewQuery::assistant("still there?"))
        .await
        .unwrap();
    mesh.settle().await.unwrap();
    assert_eq!(
        mesh.responses(0),
        vec![(query_id, MemoryBackend::answer_for("still there?"))]
    );
    mesh.shutdown().await;
}
