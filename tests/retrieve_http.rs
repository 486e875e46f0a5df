use std::path::Path;

use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::{Value, json};
use tempfile::tempdir;
use url::Url;

const PATH: &str = "/ajax/comments_actions.php";

fn comment(id: u64, parent: u64, story: u64) -> String {
    format!(
        r#"<div class="comment" data-id="{id}" data-meta="pid={parent};aid=7;sid={story};said=3;d=2024-05-01T10:00:00+03:00;de=0;r=4;av=5,1"><div class="comment__body"><div class="comment__user" data-name="user{id}" data-id="7"></div><div class="comment__content"><p>comment {id}</p></div></div></div>"#
    )
}

fn post(id: u64, story: u64, target: u64) -> String {
    format!(
        r#"<div class="comment comment_comstory" data-id="{id}" data-url="https://pikabu.ru/story/linked_post_{target}" data-meta="pid=0;aid=7;sid={story};said=3;de=0;r=0;av=0,0"><div class="comment__content"><p>see post</p></div></div>"#
    )
}

fn story_page(total: u64, min_id: u64, tree: Value, comments: &[(u64, String)]) -> String {
    let comments: Vec<Value> = comments
        .iter()
        .map(|(id, html)| json!({ "id": id, "html": html }))
        .collect();
    json!({
        "result": true,
        "message": "",
        "data": { "total": total, "min_id": min_id, "tree": tree, "comments": comments },
    })
    .to_string()
}

fn args(server: &MockServer, story_id: u64, out: &Path) -> thread_harvest::CliArgs {
    thread_harvest::CliArgs {
        story_id,
        endpoint: Url::parse(&server.url(PATH)).unwrap(),
        query: vec!["g=goog".to_string()],
        user_agent: vec!["test-agent".to_string()],
        max_concurrency: 4,
        timeout_secs: 5,
        call_timeout_secs: 20,
        batch_cap: 300,
        strategy: thread_harvest::Strategy::ByIds,
        expand_posts: false,
        max_expansion_depth: 4,
        extract_workers: Some(2),
        out: Some(out.to_path_buf()),
        pretty: true,
        progress: thread_harvest::ProgressMode::Never,
    }
}

fn read_report(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn ids(report: &Value) -> Vec<u64> {
    report["comments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn harvests_full_thread_over_http() {
    let server = MockServer::start();

    let listing = server.mock(|when, then| {
        when.method(POST)
            .path(PATH)
            .query_param("g", "goog")
            .header("user-agent", "test-agent")
            .x_www_form_urlencoded_tuple("action", "get_story_comments")
            .x_www_form_urlencoded_tuple("story_id", "1");
        then.status(200)
            .header("Content-Type", "application/json")
            .body(story_page(
                4,
                100,
                json!([[1, 0, [[2, 0]]], [3, 0]]),
                &[(100, comment(100, 0, 1)), (103, comment(103, 0, 1))],
            ));
    });
    let by_ids = server.mock(|when, then| {
        when.method(POST)
            .path(PATH)
            .query_param("g", "goog")
            .x_www_form_urlencoded_tuple("action", "get_comments_by_ids")
            .x_www_form_urlencoded_tuple("ids", "101,102");
        then.status(200)
            .header("Content-Type", "application/json")
            .body(
                json!({
                    "result": true,
                    "data": [
                        { "id": 101, "html": comment(101, 100, 1) },
                        { "id": 102, "html": comment(102, 101, 1) },
                    ],
                })
                .to_string(),
            );
    });

    let tmp = tempdir().unwrap();
    let out = tmp.path().join("reports/story-1.json");
    thread_harvest::run(args(&server, 1, &out)).await.unwrap();

    listing.assert();
    by_ids.assert();

    let report = read_report(&out);
    assert_eq!(report["story_id"], 1);
    assert_eq!(report["total"], 4);
    assert_eq!(report["complete"], true);
    assert_eq!(ids(&report), vec![100, 101, 102, 103]);
    assert_eq!(report["missing"], json!([]));
    assert_eq!(report["errors"], json!([]));
    assert_eq!(report["metrics"]["requests"], 2);

    let reply = &report["comments"][2];
    assert_eq!(reply["parent_id"], 101);
    assert_eq!(reply["author"]["name"], "user102");
    assert_eq!(reply["rating_total"], 4);
    assert_eq!(reply["votes_up"], 5);
    assert_eq!(reply["votes_down"], 1);
    assert_eq!(reply["content"]["text"], "comment 102");
}

#[tokio::test]
async fn failed_batch_leaves_ids_missing() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST)
            .path(PATH)
            .x_www_form_urlencoded_tuple("action", "get_story_comments");
        then.status(200).body(story_page(
            3,
            100,
            json!([[1, 0], [2, 0]]),
            &[(100, comment(100, 0, 1))],
        ));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path(PATH)
            .x_www_form_urlencoded_tuple("action", "get_comments_by_ids");
        then.status(500).body("boom");
    });

    let tmp = tempdir().unwrap();
    let out = tmp.path().join("report.json");
    thread_harvest::run(args(&server, 1, &out)).await.unwrap();

    let report = read_report(&out);
    assert_eq!(report["complete"], false);
    assert_eq!(ids(&report), vec![100]);
    assert_eq!(report["missing"], json!([101, 102]));
    assert_eq!(report["metrics"]["failed_batches"], 1);
    assert!(report["errors"][0].as_str().unwrap().contains("get_comments_by_ids"));
}

#[tokio::test]
async fn expands_embedded_posts() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST)
            .path(PATH)
            .x_www_form_urlencoded_tuple("action", "get_story_comments")
            .x_www_form_urlencoded_tuple("story_id", "1");
        then.status(200).body(story_page(
            2,
            10,
            json!([[1, 0]]),
            &[(10, comment(10, 0, 1)), (11, post(11, 1, 2))],
        ));
    });
    let linked = server.mock(|when, then| {
        when.method(POST)
            .path(PATH)
            .x_www_form_urlencoded_tuple("action", "get_story_comments")
            .x_www_form_urlencoded_tuple("story_id", "2");
        then.status(200)
            .body(story_page(1, 20, json!([]), &[(20, post(20, 2, 1))]));
    });

    let tmp = tempdir().unwrap();
    let out = tmp.path().join("report.json");
    let mut args = args(&server, 1, &out);
    args.expand_posts = true;
    thread_harvest::run(args).await.unwrap();

    linked.assert_hits(1);
    let report = read_report(&out);
    assert_eq!(ids(&report), vec![10, 11, 20]);
    assert_eq!(report["expanded"], json!([{ "story_id": 2, "total": 1 }]));
    assert_eq!(report["complete"], true);
    assert_eq!(report["comments"][1]["embedded_post"]["id"], 2);
}

#[tokio::test]
async fn malformed_snapshot_fails_the_run() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(PATH);
        then.status(200).body(r#"{"result":true,"data":{"total":3}}"#);
    });

    let tmp = tempdir().unwrap();
    let out = tmp.path().join("report.json");
    let err = thread_harvest::run(args(&server, 1, &out)).await.unwrap_err();
    assert!(format!("{err:#}").contains("get_story_comments"));
    assert!(!out.exists());
}
