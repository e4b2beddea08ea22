//! Request/response, context resolution and push reconciliation over an
//! in-memory socket

mod common;

use std::sync::{Arc, Mutex};

use common::{connected_session, graph_payload};
use graphsync_client::testing::{
    error_payload, graph_push_payload, push_envelope, resource_payload, response_envelope,
    value_payload, void_payload,
};
use graphsync_client::transport::{PushListener, PushMessage};
use graphsync_client::{
    AuthHint, FindOptions, GraphRequest, GraphResult, Record, RecordEvent, SyncError,
};
use serde_json::json;

#[tokio::test]
async fn test_get_with_subscribe_resolves_resource() {
    let (session, mut peer, _listener) = connected_session().await;
    let graph = session.graph().clone();
    let call = tokio::spawn(async move {
        graph
            .request(GraphRequest::get("a.b.instance:private").with_subscribe(true))
            .await
    });

    let request = peer.expect_request("graph").await;
    assert_eq!(request["type"], "request");
    assert_eq!(
        graph_payload(&request),
        &json!({ "gri": "a.b.instance:private", "operation": "get", "subscribe": true })
    );

    let resource = json!({ "gri": "a.b.instance:private", "name": "A" });
    peer.respond(&request, resource_payload(resource.clone()));
    let result = call.await.unwrap().unwrap();
    assert_eq!(result, GraphResult::Resource(resource));
}

#[tokio::test]
async fn test_backend_error_is_passed_through() {
    let (session, mut peer, _listener) = connected_session().await;
    let graph = session.graph().clone();
    let call = tokio::spawn(async move { graph.request(GraphRequest::get("a.b.instance:private")).await });

    let request = peer.expect_request("graph").await;
    peer.respond(
        &request,
        json!({ "success": false, "error": { "id": "notFound", "details": { "gri": "a.b" } } }),
    );
    let err = call.await.unwrap().unwrap_err();
    let backend = err.backend().expect("backend error");
    assert_eq!(backend.id, "notFound");
    assert_eq!(backend.details, Some(json!({ "gri": "a.b" })));
}

#[tokio::test]
async fn test_forbidden_get_retries_through_registered_context() {
    let (session, mut peer, _listener) = connected_session().await;
    let gri = "user.u2.instance:shared";
    let adapter = session.adapter().clone();
    let find = tokio::spawn(async move { adapter.find_record("user", gri, FindOptions::default()).await });

    let first = peer.expect_request("graph").await;
    assert!(graph_payload(&first).get("authHint").is_none());

    // Context learned while the first attempt was in flight
    assert!(session.contexts().register(gri, "space.s1.users", None));
    peer.respond(&first, error_payload("forbidden"));

    let second = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&second)["authHint"], "throughSpace:s1");
    peer.respond(&second, resource_payload(json!({ "gri": gri, "name": "Bob" })));

    let record = find.await.unwrap().unwrap();
    assert!(!record.is_forbidden);
    assert_eq!(record.get("name"), Some(&json!("Bob")));
    let cached = session.adapter().store().peek_record("user", gri).unwrap();
    assert!(!cached.is_forbidden);
}

#[tokio::test]
async fn test_exhausted_contexts_mark_record_forbidden() {
    let (session, mut peer, _listener) = connected_session().await;
    let gri = "user.u3.instance:shared";
    session.contexts().register(gri, "group.g1.users", None);
    session.contexts().register(gri, "space.s1.users", None);
    let mut events = session.adapter().subscribe();

    let adapter = session.adapter().clone();
    let find = tokio::spawn(async move { adapter.find_record("user", gri, FindOptions::default()).await });

    // Most recent context first
    let request = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&request)["authHint"], "throughSpace:s1");
    peer.respond(&request, error_payload("forbidden"));

    let request = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&request)["authHint"], "throughGroup:g1");
    peer.respond(&request, error_payload("forbidden"));

    // Final attempt without any hint
    let request = peer.expect_request("graph").await;
    assert!(graph_payload(&request).get("authHint").is_none());
    peer.respond(&request, error_payload("forbidden"));

    let err = find.await.unwrap().unwrap_err();
    assert!(err.is_forbidden());
    assert!(session.contexts().get_context(gri).is_none());
    assert!(session.adapter().store().peek_record("user", gri).unwrap().is_forbidden);
    assert_eq!(
        events.recv().await.unwrap(),
        RecordEvent::ForbiddenChanged {
            model_name: "user".into(),
            gri: gri.into(),
            forbidden: true,
        }
    );
}

#[tokio::test]
async fn test_non_forbidden_error_stops_resolution() {
    let (session, mut peer, _listener) = connected_session().await;
    let gri = "user.u4.instance:shared";
    session.contexts().register(gri, "space.s1.users", None);
    session.contexts().register(gri, "space.s2.users", None);

    let adapter = session.adapter().clone();
    let find = tokio::spawn(async move { adapter.find_record("user", gri, FindOptions::default()).await });

    let request = peer.expect_request("graph").await;
    peer.respond(&request, error_payload("forbidden"));
    let request = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&request)["authHint"], "throughSpace:s1");
    peer.respond(&request, error_payload("internalServerError"));

    let err = find.await.unwrap().unwrap_err();
    assert_eq!(err.backend().unwrap().id, "internalServerError");
    assert!(!session.adapter().store().peek_record("user", gri).is_some_and(|r| r.is_forbidden));
}

#[tokio::test]
async fn test_invalid_auth_hint_fails_before_sending() {
    let (session, _peer, _listener) = connected_session().await;
    let request = GraphRequest::get("a.b.instance:private").with_auth_hint(Some(AuthHint::new("throughSpace", "")));
    let err = session.graph().request(request).await.unwrap_err();
    assert!(matches!(err, SyncError::Gri(_)));
    assert_eq!(session.channel().pending_count(), 0);
}

#[tokio::test]
async fn test_deleted_push_marks_record_once() {
    let (session, peer, _listener) = connected_session().await;
    let gri = "x.1.instance:private";
    session
        .adapter()
        .store()
        .push_record(Record::new("x", gri).with_revision(1));
    let mut events = session.adapter().subscribe();

    peer.push("graph", graph_push_payload("deleted", gri, None));
    assert_eq!(
        events.recv().await.unwrap(),
        RecordEvent::Deleted {
            model_name: "x".into(),
            gri: gri.into(),
        }
    );
    assert!(session.adapter().store().peek_record("x", gri).unwrap().is_deleted);

    // Second identical push, then a marker push to know both were handled
    peer.push("graph", graph_push_payload("deleted", gri, None));
    peer.push(
        "graph",
        graph_push_payload("updated", "x.2.instance:private", Some(json!({ "revision": 1 }))),
    );
    let next = events.recv().await.unwrap();
    assert_eq!(next.gri(), "x.2.instance:private");
    assert!(matches!(next, RecordEvent::Reloaded { .. }));
}

#[tokio::test]
async fn test_stale_update_push_is_ignored() {
    let (session, peer, _listener) = connected_session().await;
    let gri = "x.1.instance:private";
    let mut data = serde_json::Map::new();
    data.insert("name".into(), json!("current"));
    session
        .adapter()
        .store()
        .push_record(Record::new("x", gri).with_revision(5).with_data(data));
    let mut events = session.adapter().subscribe();

    peer.push(
        "graph",
        graph_push_payload("updated", gri, Some(json!({ "revision": 5, "name": "old" }))),
    );
    peer.push(
        "graph",
        graph_push_payload("updated", gri, Some(json!({ "revision": 6, "name": "new" }))),
    );

    // Only the newer revision produces an event
    assert_eq!(
        events.recv().await.unwrap(),
        RecordEvent::Reloaded {
            model_name: "x".into(),
            gri: gri.into(),
        }
    );
    let cached = session.adapter().store().peek_record("x", gri).unwrap();
    assert_eq!(cached.revision, Some(6));
    assert_eq!(cached.get("name"), Some(&json!("new")));
}

struct RecordingListener {
    seen: Mutex<Vec<String>>,
}

impl PushListener for RecordingListener {
    fn on_push(&self, push: &PushMessage) -> graphsync_client::Result<()> {
        let gri = push.payload["gri"].as_str().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push(gri);
        Ok(())
    }
}

#[tokio::test]
async fn test_batch_is_dispatched_in_order_once() {
    let (session, mut peer, _listener) = connected_session().await;
    let recorder = Arc::new(RecordingListener {
        seen: Mutex::new(Vec::new()),
    });
    session.channel().add_push_listener(recorder.clone());
    let mut events = session.adapter().subscribe();

    let graph = session.graph().clone();
    let call = tokio::spawn(async move { graph.request(GraphRequest::get("v.1.instance:private")).await });
    let request = peer.expect_request("graph").await;

    peer.send_batch(vec![
        response_envelope(&request, value_payload(json!(42))),
        push_envelope(
            "graph",
            graph_push_payload("updated", "x.7.instance:private", Some(json!({ "revision": 1 }))),
        ),
        push_envelope(
            "graph",
            graph_push_payload("updated", "x.8.instance:private", Some(json!({ "revision": 1 }))),
        ),
    ]);

    assert_eq!(call.await.unwrap().unwrap(), GraphResult::Value(json!(42)));
    assert_eq!(events.recv().await.unwrap().gri(), "x.7.instance:private");
    assert_eq!(events.recv().await.unwrap().gri(), "x.8.instance:private");
    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec!["x.7.instance:private".to_string(), "x.8.instance:private".to_string()]
    );
    assert_eq!(session.channel().pending_count(), 0);
}

#[tokio::test]
async fn test_forbidden_nosub_push_recovers_through_context() {
    let (session, mut peer, _listener) = connected_session().await;
    let gri = "user.u5.instance:shared";
    session.contexts().register(gri, "space.s20.users", None);
    session.contexts().register(gri, "space.s1.users", None);
    session.contexts().register(gri, "space.s2.users", None);
    session
        .adapter()
        .store()
        .push_record(Record::new("user", gri).with_revision(1));
    let mut events = session.adapter().subscribe();

    peer.push(
        "nosub",
        json!({ "gri": gri, "reason": "forbidden", "authHint": "throughSpace:s2" }),
    );

    // The failed context is dropped; the remaining one is tried
    let request = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&request)["authHint"], "throughSpace:s1");
    assert_eq!(graph_payload(&request)["subscribe"], true);
    peer.respond(&request, resource_payload(json!({ "gri": gri, "revision": 2 })));

    assert_eq!(
        events.recv().await.unwrap(),
        RecordEvent::Reloaded {
            model_name: "user".into(),
            gri: gri.into(),
        }
    );
    let cached = session.adapter().store().peek_record("user", gri).unwrap();
    assert_eq!(cached.revision, Some(2));
    assert!(!cached.is_forbidden);

    // Only the context behind the hint was dropped
    let remaining: Vec<String> = session
        .contexts()
        .entries(gri)
        .into_iter()
        .map(|entry| entry.context_gri)
        .collect();
    assert_eq!(remaining, vec!["space.s20.users", "space.s1.users"]);
}

#[tokio::test]
async fn test_update_and_delete_target_private_scope() {
    let (session, mut peer, _listener) = connected_session().await;
    let gri = "space.s1.instance:auto";
    session
        .adapter()
        .store()
        .push_record(Record::new("space", gri).with_revision(1));

    let adapter = session.adapter().clone();
    let update = tokio::spawn(async move {
        adapter
            .update_record("space", gri, json!({ "name": "Renamed", "description": null }))
            .await
    });
    let request = peer.expect_request("graph").await;
    assert_eq!(
        graph_payload(&request),
        &json!({
            "gri": "space.s1.instance:private",
            "operation": "update",
            "data": { "name": "Renamed" },
            "subscribe": false,
        })
    );
    peer.respond(&request, void_payload());
    let updated = update.await.unwrap().unwrap().unwrap();
    assert_eq!(updated.get("name"), Some(&json!("Renamed")));

    let adapter = session.adapter().clone();
    let delete = tokio::spawn(async move { adapter.delete_record("space", gri).await });
    let request = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&request)["gri"], "space.s1.instance:private");
    assert_eq!(graph_payload(&request)["operation"], "delete");
    peer.respond(&request, void_payload());
    delete.await.unwrap().unwrap();
    assert!(session.adapter().store().peek_record("space", gri).unwrap().is_deleted);
}

#[tokio::test]
async fn test_unrevisioned_push_does_not_reopen_stale_revisions() {
    let (session, _peer, _listener) = connected_session().await;
    let adapter = session.adapter();
    let gri = "x.1.instance:private";

    adapter
        .push_updated(gri, json!({ "revision": 5, "name": "v5" }))
        .unwrap()
        .unwrap();
    let merged = adapter.push_updated(gri, json!({ "flag": true })).unwrap().unwrap();
    assert_eq!(merged.revision, Some(5));

    // A late, older revision must not win
    assert!(adapter
        .push_updated(gri, json!({ "revision": 3, "name": "v3" }))
        .unwrap()
        .is_none());
    let cached = adapter.store().peek_record("x", gri).unwrap();
    assert_eq!(cached.revision, Some(5));
    assert_eq!(cached.get("name"), Some(&json!("v5")));
    assert_eq!(cached.get("flag"), Some(&json!(true)));
}

#[tokio::test]
async fn test_stale_collection_push_keeps_contexts() {
    let (session, _peer, _listener) = connected_session().await;
    let list_gri = "space.s1.eff_users:private";
    let member = "user.u1.instance:shared";
    session
        .adapter()
        .store()
        .push_record(Record::new("space", list_gri).with_revision(3));
    session.contexts().register(member, list_gri, Some(list_gri));

    let stale = session
        .adapter()
        .push_updated(list_gri, json!({ "revision": 2, "list": [] }))
        .unwrap();
    assert!(stale.is_none());
    assert_eq!(session.contexts().get_context(member).as_deref(), Some(list_gri));

    let fresh = session
        .adapter()
        .push_updated(list_gri, json!({ "revision": 4, "list": [] }))
        .unwrap();
    assert!(fresh.is_some());
    assert!(session.contexts().get_context(member).is_none());
}

#[tokio::test]
async fn test_delete_reloads_lists_containing_entity() {
    let (session, mut peer, _listener) = connected_session().await;
    let gri = "space.s1.instance:auto";
    let listing = "user.u1.eff_spaces:private";
    let store = session.adapter().store();
    store.push_record(Record::new("space", gri).with_revision(1));
    let lists = [
        (listing, json!(["space.s1.instance:auto", "space.s2.instance:auto"]), false),
        ("group.g1.eff_spaces:private", json!(["space.s2.instance:auto"]), false),
        ("user.u2.eff_spaces:private", json!(["space.s1.instance:auto"]), true),
    ];
    for (list_gri, members, forbidden) in lists {
        let mut data = serde_json::Map::new();
        data.insert("list".into(), members);
        let mut list = Record::new("space-list", list_gri).with_revision(1).with_data(data);
        list.is_forbidden = forbidden;
        store.push_record(list);
    }

    let adapter = session.adapter().clone();
    let delete = tokio::spawn(async move { adapter.delete_record("space", gri).await });
    let request = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&request)["operation"], "delete");
    peer.respond(&request, void_payload());

    // Only the accessible list that contained s1 is fetched again
    let reload = peer.expect_request("graph").await;
    assert_eq!(graph_payload(&reload)["gri"], listing);
    assert_eq!(graph_payload(&reload)["operation"], "get");
    peer.respond(
        &reload,
        resource_payload(json!({ "gri": listing, "revision": 2, "list": ["space.s2.instance:auto"] })),
    );
    delete.await.unwrap().unwrap();

    let reloaded = store.peek_record("space-list", listing).unwrap();
    assert_eq!(reloaded.revision, Some(2));
    assert_eq!(reloaded.get("list"), Some(&json!(["space.s2.instance:auto"])));
    assert!(store.peek_record("space", gri).unwrap().is_deleted);

    let extra = tokio::time::timeout(std::time::Duration::from_millis(100), peer.recv_request()).await;
    assert!(extra.is_err(), "no other list reloads expected");
}

#[tokio::test]
async fn test_recalculate_without_matching_lists_sends_nothing() {
    let (session, _peer, _listener) = connected_session().await;
    let reloaded = session
        .adapter()
        .recalculate_lists_with_entity("space", "s1")
        .await
        .unwrap();
    assert!(reloaded.is_empty());
    assert_eq!(session.channel().pending_count(), 0);
}

#[tokio::test]
async fn test_user_gri() {
    let (session, _peer, _listener) = connected_session().await;
    assert_eq!(session.adapter().user_gri("u1").unwrap(), "user.u1.instance:auto");
}
