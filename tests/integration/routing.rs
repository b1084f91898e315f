use crate::*;

use pulse_services::NewQuery;

/// A-B-C line: A and B are offline, only C reaches the backend.
/// The query hops through B, C answers, and the answer hops back.
#[tokio::test]
async fn test_query_relayed_through_line_topology() {
    let mut mesh = mesh(&[("phone-a", false), ("phone-b", false), ("gateway-c", true)]);
    mesh.cut(0, 2);

    let query_id = mesh
        .node(0)
        .send_query(NewQuery::assistant("where is the shelter"))
        .await
        .unwrap();
    mesh.settle().await.unwrap();

    let responses = mesh.responses(0);
    assert_eq!(
        responses,
        vec![(
            query_id.clone(),
            MemoryBackend::answer_for("where is the shelter")
        )]
    );

    let submitted = mesh.devices[2].backend.queries();
    assert_eq!(submitted.len(), 1, "gateway submits exactly once");
    assert_eq!(submitted[0].query_id, query_id);
    assert_eq!(submitted[0].original_device, "phone-a");
    assert_eq!(submitted[0].relayed_by, "gateway-c");

    // the middle hop never answers anything itself
    assert!(mesh.responses(1).is_empty());
    assert!(mesh.devices[1].backend.queries().is_empty());

    let a = mesh.status(0).await;
    assert_eq!(a.pending_queries, 0);
    assert_eq!(a.partial_messages, 0);
    mesh.shutdown().await;
}

/// Everyone hears everyone: the relay copy from B must not cause a
/// second submission or a second delivery.
#[tokio::test]
async fn test_fully_connected_mesh_delivers_once() {
    let mut mesh = mesh(&[("phone-a", false), ("phone-b", false), ("gateway-c", true)]);

    let query_id = mesh
        .node(0)
        .send_query(NewQuery::assistant("water"))
        .await
        .unwrap();
    mesh.settle().await.unwrap();

    assert_eq!(
        mesh.responses(0),
        vec![(query_id, MemoryBackend::answer_for("water"))]
    );
    assert_eq!(mesh.devices[2].backend.queries().len(), 1);
    mesh.shutdown().await;
}

/// An online device talks to the backend directly and stays off the air.
#[tokio::test]
async fn test_online_query_bypasses_mesh() {
    let mut mesh = mesh(&[("phone-a", true), ("phone-b", false)]);

    let query_id = mesh
        .node(0)
        .send_query(NewQuery::assistant("news"))
        .await
        .unwrap();
    mesh.settle().await.unwrap();

    assert_eq!(
        mesh.responses(0),
        vec![(query_id, MemoryBackend::answer_for("news"))]
    );
    assert_eq!(mesh.medium.sent_by(&mesh.devices[0].endpoint), 0);
    assert_eq!(mesh.status(1).await.partial_messages, 0);
    mesh.shutdown().await;
}

/// A gateway whose backend is down sends nothing back and the query
/// stays pending; asking again after recovery gets through.
#[tokio::test]
async fn test_gateway_failure_leaves_query_pending() {
    let mut mesh = mesh(&[("phone-a", false), ("gateway-b", true)]);
    mesh.devices[1].backend.set_failing(true);

    let query_id = mesh
        .node(0)
        .send_query(NewQuery {
            query_id: Some("q-retry".into()),
            ..NewQuery::assistant("medic")
        })
        .await
        .unwrap();
    assert_eq!(query_id, "q-retry");
    mesh.settle().await.unwrap();
    assert!(mesh.responses(0).is_empty());
    assert_eq!(mesh.status(0).await.pending_queries, 1);

    mesh.devices[1].backend.set_failing(false);
    // same text, fresh id
    let retry_id = mesh
        .node(0)
        .send_query(NewQuery::assistant("medic"))
        .await
        .unwrap();
    mesh.settle().await.unwrap();

    let responses = mesh.responses(0);
    assert_eq!(responses, vec![(retry_id, MemoryBackend::answer_for("medic"))]);
    mesh.shutdown().await;
}

/// A-D-G line with G's backend down. Asking the same id again after the
/// backend recovers travels the mesh under a new message id, so D relays
/// it again and G submits it.
#[tokio::test]
async fn test_reasking_same_id_after_gateway_recovers() {
    let mut mesh = mesh(&[("phone-a", false), ("phone-d", false), ("gateway-g", true)]);
    mesh.cut(0, 2);
    mesh.devices[2].backend.set_failing(true);

    let ask = NewQuery {
        query_id: Some("q-same".into()),
        ..NewQuery::assistant("evacuation route")
    };
    mesh.node(0).send_query(ask.clone()).await.unwrap();
    mesh.settle().await.unwrap();
    assert!(mesh.responses(0).is_empty());
    assert!(mesh.devices[2].backend.queries().is_empty());
    assert_eq!(mesh.status(0).await.pending_queries, 1);

    mesh.devices[2].backend.set_failing(false);
    let sent_before = mesh.medium.transmitted();
    let again = mesh.node(0).send_query(ask).await.unwrap();
    assert_eq!(again, "q-same");
    assert!(mesh.settle().await.unwrap() > 0);
    assert!(mesh.medium.transmitted() > sent_before);

    assert_eq!(
        mesh.responses(0),
        vec![("q-same".to_string(), MemoryBackend::answer_for("evacuation route"))]
    );
    let submitted = mesh.devices[2].backend.queries();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].original_device, "phone-a");
    assert_eq!(mesh.status(0).await.pending_queries, 0);
    mesh.shutdown().await;
}

/// Responses typed in by a human on another device travel the mesh too.
#[tokio::test]
async fn test_manual_response_reaches_asker() {
    let mut mesh = mesh(&[("phone-a", false), ("phone-b", false)]);

    let query_id = mesh
        .node(0)
        .send_query(NewQuery::assistant("anyone have a map?"))
        .await
        .unwrap();
    mesh.settle().await.unwrap();

    mesh.node(1)
        .send_response(&query_id, "north gate is open")
        .await
        .unwrap();
    mesh.settle().await.unwrap();

    assert_eq!(
        mesh.responses(0),
        vec![(query_id, "north gate is open".to_string())]
    );
    mesh.shutdown().await;
}
