//! The put protocol: interactive writes, conflicts, and the
//! `new_edits=false` replication path.

mod common;

use common::{child, read_revisions, read_stored_doc, root, test_db};
use serde_json::json;
use sofadb::Options;

#[tokio::test]
async fn create_new_document() {
    let t = test_db().await;
    let rev = t.put("foo", json!({"foo": "bar"})).await;
    assert_eq!(rev, "1-9bb58f26192e4ba00f01e2e7b136bbd8");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![root(1, "9bb58f26192e4ba00f01e2e7b136bbd8")]
    );
}

#[tokio::test]
async fn doc_rev_and_option_rev_mismatch() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({"_rev": "1-1234567890abcdef1234567890abcdef", "foo": "bar"}),
            Options::new().rev("2-1234567890abcdef1234567890abcdef"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert_eq!(err.to_string(), "Document rev and option have different values");
}

#[tokio::test]
async fn create_with_body_rev_conflicts() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({"_rev": "1-1234567890abcdef1234567890abcdef", "foo": "bar"}),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
    assert_eq!(err.to_string(), "conflict");
}

#[tokio::test]
async fn create_with_option_rev_conflicts() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({"foo": "bar"}),
            Options::new().rev("1-1234567890abcdef1234567890abcdef"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
}

#[tokio::test]
async fn update_without_rev_conflicts() {
    let t = test_db().await;
    t.put("foo", json!({"foo": "bar"})).await;
    let err = t
        .try_put("foo", json!({"foo": "baz"}), Options::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
}

#[tokio::test]
async fn update_with_wrong_rev_conflicts() {
    let t = test_db().await;
    t.put("foo", json!({"foo": "bar"})).await;
    let err = t
        .try_put(
            "foo",
            json!({"_rev": "2-1234567890abcdef1234567890abcdef", "foo": "baz"}),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
}

#[tokio::test]
async fn update_with_correct_rev() {
    let t = test_db().await;
    let rev1 = t.put("foo", json!({"foo": "bar"})).await;
    let rev2 = t
        .put("foo", json!({"_rev": rev1, "foo": "baz"}))
        .await;
    assert_eq!(rev2, "2-afa7ae8a1906f4bb061be63525974f92");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![
            root(1, "9bb58f26192e4ba00f01e2e7b136bbd8"),
            child(
                2,
                "afa7ae8a1906f4bb061be63525974f92",
                1,
                "9bb58f26192e4ba00f01e2e7b136bbd8"
            ),
        ]
    );
}

#[tokio::test]
async fn replicated_put_creates_parentless_node() {
    let t = test_db().await;
    let rev = t
        .put_replicated(
            "foo",
            json!({"_rev": "1-6fe51f74859f3579abaccc426dd5104f", "foo": "baz"}),
        )
        .await;
    assert_eq!(rev, "1-6fe51f74859f3579abaccc426dd5104f");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![root(1, "6fe51f74859f3579abaccc426dd5104f")]
    );
}

#[tokio::test]
async fn replicated_put_requires_rev_or_revisions() {
    let t = test_db().await;
    let err = t
        .try_put("foo", json!({"foo": "baz"}), Options::new().new_edits(false))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert_eq!(
        err.to_string(),
        "When `new_edits: false`, the document needs `_rev` or `_revisions` specified"
    );
}

#[tokio::test]
async fn replicated_put_adds_conflicting_branch() {
    let t = test_db().await;
    t.put("foo", json!({"foo": "bar"})).await;
    let rev = t
        .put_replicated("foo", json!({"_rev": "1-asdf", "foo": "baz"}))
        .await;
    assert_eq!(rev, "1-asdf");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![
            root(1, "9bb58f26192e4ba00f01e2e7b136bbd8"),
            root(1, "asdf"),
        ]
    );
}

#[tokio::test]
async fn replicated_replay_is_idempotent_and_keeps_stored_body() {
    let t = test_db().await;
    let rev1 = t.put("foo", json!({"foo": "bar"})).await;
    // Replaying the same revision with a different body must not clobber
    // the stored bytes.
    let rev = t
        .put_replicated("foo", json!({"_rev": rev1.clone(), "foo": "baz"}))
        .await;
    assert_eq!(rev, rev1);

    let conn = t.raw();
    assert_eq!(
        read_stored_doc(&conn, "foo", 1, "9bb58f26192e4ba00f01e2e7b136bbd8"),
        r#"{"foo":"bar"}"#
    );
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![root(1, "9bb58f26192e4ba00f01e2e7b136bbd8")]
    );
}

#[tokio::test]
async fn doc_id_must_match_body_id() {
    let t = test_db().await;
    let err = t
        .try_put("foo", json!({"_id": "bar", "foo": "baz"}), Options::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert_eq!(err.to_string(), "Document ID must match _id in document");
}

#[tokio::test]
async fn deleted_true_writes_tombstone() {
    let t = test_db().await;
    let rev = t.put("foo", json!({"_deleted": true, "foo": "bar"})).await;
    assert_eq!(rev, "1-6872a0fc474ada5c46ce054b92897063");

    let conn = t.raw();
    let deleted: bool = conn
        .query_row(
            r#"SELECT deleted FROM "test" WHERE id = 'foo' ORDER BY rev DESC, rev_id DESC LIMIT 1"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(deleted);
}

#[tokio::test]
async fn deleted_false_is_a_plain_write() {
    let t = test_db().await;
    let rev = t.put("foo", json!({"_deleted": false, "foo": "bar"})).await;
    // Hashes identically to the body without the field.
    assert_eq!(rev, "1-9bb58f26192e4ba00f01e2e7b136bbd8");

    let conn = t.raw();
    let deleted: bool = conn
        .query_row(
            r#"SELECT deleted FROM "test" WHERE id = 'foo'"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(!deleted);
}

#[tokio::test]
async fn replicated_tombstone() {
    let t = test_db().await;
    let rev = t
        .put_replicated("foo", json!({"_deleted": true, "foo": "bar", "_rev": "1-abc"}))
        .await;
    assert_eq!(rev, "1-abc");

    let conn = t.raw();
    let deleted: bool = conn
        .query_row(
            r#"SELECT deleted FROM "test" WHERE id = 'foo' AND rev = 1 AND rev_id = 'abc'"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(deleted);
}

// =============================================================================
// `_revisions` handling
// =============================================================================

#[tokio::test]
async fn replicated_revisions_chain() {
    let t = test_db().await;
    let rev = t
        .put_replicated(
            "foo",
            json!({
                "_revisions": {"start": 3, "ids": ["ghi", "def", "abc"]},
                "foo": "bar",
            }),
        )
        .await;
    assert_eq!(rev, "3-ghi");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![
            root(1, "abc"),
            child(2, "def", 1, "abc"),
            child(3, "ghi", 2, "def"),
        ]
    );
}

#[tokio::test]
async fn revisions_override_body_rev() {
    let t = test_db().await;
    let rev = t
        .put_replicated(
            "foo",
            json!({
                "_revisions": {"start": 1, "ids": ["ghi"]},
                "_rev": "1-abc",
                "foo": "bar",
            }),
        )
        .await;
    assert_eq!(rev, "1-ghi");

    let conn = t.raw();
    assert_eq!(read_revisions(&conn, "foo"), vec![root(1, "ghi")]);
}

#[tokio::test]
async fn revisions_vs_option_rev_is_conflict() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({
                "_revisions": {"start": 1, "ids": ["ghi"]},
                "foo": "bar",
            }),
            Options::new().new_edits(false).rev("1-abc"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
    assert_eq!(err.to_string(), "Document rev and option have different values");
}

#[tokio::test]
async fn revisions_replay_is_idempotent() {
    let t = test_db().await;
    let body = json!({
        "_revisions": {"start": 3, "ids": ["ghi", "def", "abc"]},
        "foo": "bar",
    });
    t.put_replicated("foo", body.clone()).await;
    let rev = t.put_replicated("foo", body).await;
    assert_eq!(rev, "3-ghi");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![
            root(1, "abc"),
            child(2, "def", 1, "abc"),
            child(3, "ghi", 2, "def"),
        ]
    );
}

#[tokio::test]
async fn revisions_adopt_existing_parentless_nodes() {
    let t = test_db().await;
    {
        let conn = t.raw();
        conn.execute_batch(
            r#"INSERT INTO "test_revs" (id, rev, rev_id)
               VALUES ('foo', 1, 'abc'), ('foo', 2, 'def')"#,
        )
        .unwrap();
    }
    let rev = t
        .put_replicated(
            "foo",
            json!({
                "_revisions": {"start": 3, "ids": ["ghi", "def", "abc"]},
                "foo": "bar",
            }),
        )
        .await;
    assert_eq!(rev, "3-ghi");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![
            root(1, "abc"),
            child(2, "def", 1, "abc"),
            child(3, "ghi", 2, "def"),
        ]
    );
}

#[tokio::test]
async fn new_edit_with_revisions_conflicts_for_new_doc() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({
                "_revisions": {"start": 3, "ids": ["ghi", "def", "abc"]},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
}

#[tokio::test]
async fn new_edit_with_revisions_conflicts_for_wrong_rev() {
    let t = test_db().await;
    t.put("foo", json!({"foo": "bar"})).await;
    let err = t
        .try_put(
            "foo",
            json!({
                "_revisions": {"start": 1, "ids": ["ghi"]},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
}

#[tokio::test]
async fn new_edit_with_correct_revisions_extends_chain() {
    let t = test_db().await;
    t.put_replicated("foo", json!({"foo": "bar", "_rev": "1-abc"}))
        .await;
    let rev = t
        .try_put(
            "foo",
            json!({
                "_revisions": {"start": 1, "ids": ["abc"]},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap();
    assert_eq!(rev, "2-9bb58f26192e4ba00f01e2e7b136bbd8");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![
            root(1, "abc"),
            child(2, "9bb58f26192e4ba00f01e2e7b136bbd8", 1, "abc"),
        ]
    );
}

#[tokio::test]
async fn new_edit_with_full_history() {
    let t = test_db().await;
    t.put_replicated(
        "foo",
        json!({
            "foo": "bar",
            "_revisions": {"start": 3, "ids": ["ghi", "def", "abc"]},
        }),
    )
    .await;
    let rev = t
        .try_put(
            "foo",
            json!({
                "_revisions": {"start": 3, "ids": ["ghi", "def", "abc"]},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap();
    assert_eq!(rev, "4-9bb58f26192e4ba00f01e2e7b136bbd8");

    let conn = t.raw();
    assert_eq!(
        read_revisions(&conn, "foo"),
        vec![
            root(1, "abc"),
            child(2, "def", 1, "abc"),
            child(3, "ghi", 2, "def"),
            child(4, "9bb58f26192e4ba00f01e2e7b136bbd8", 3, "ghi"),
        ]
    );
}

#[tokio::test]
async fn new_edit_with_wrong_history_conflicts() {
    let t = test_db().await;
    t.put_replicated(
        "foo",
        json!({
            "foo": "bar",
            "_revisions": {"start": 3, "ids": ["ghi", "def", "abc"]},
        }),
    )
    .await;
    let err = t
        .try_put(
            "foo",
            json!({
                "_revisions": {"start": 3, "ids": ["ghi", "xyz", "abc"]},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 409);
}

// =============================================================================
// Attachments on the write path
// =============================================================================

#[tokio::test]
async fn attachment_without_data_rejected() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({"_attachments": {"foo.txt": {}}, "foo": "bar"}),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert_eq!(err.to_string(), r#"invalid attachment data for "foo.txt""#);
}

#[tokio::test]
async fn attachment_with_invalid_base64_rejected() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({
                "_attachments": {"foo.txt": {"data": "This is not base64"}},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert!(err
        .to_string()
        .starts_with(r#"invalid attachment data for "foo.txt":"#));
}

#[tokio::test]
async fn attachment_with_non_string_data_rejected() {
    let t = test_db().await;
    let err = t
        .try_put(
            "foo",
            json!({
                "_attachments": {"foo.txt": {"data": 1234}},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    assert_eq!(
        err.to_string(),
        r#"invalid attachment data for "foo.txt": cannot decode number as base64 data"#
    );
}

#[tokio::test]
async fn attachment_stored_as_raw_bytes() {
    let t = test_db().await;
    let rev = t
        .put(
            "foo",
            json!({
                "_attachments": {
                    "foo.txt": {
                        "content_type": "text/plain",
                        "data": "VGhpcyBpcyBhIGJhc2U2NCBlbmNvZGluZw==",
                    },
                },
                "foo": "bar",
            }),
        )
        .await;
    assert!(rev.starts_with("1-"));

    let conn = t.raw();
    let stored: Vec<u8> = conn
        .query_row(
            r#"SELECT data FROM "test_attachments" WHERE id = 'foo' AND filename = 'foo.txt'"#,
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stored, b"This is a base64 encoding");
}

// =============================================================================
// Atomicity
// =============================================================================

#[tokio::test]
async fn failed_put_leaves_no_rows() {
    let t = test_db().await;
    // A stub with no parent revision fails after the revision node and
    // body row inserts; the rollback must erase all of it.
    let err = t
        .try_put(
            "foo",
            json!({
                "_attachments": {"foo.txt": {"stub": true}},
                "foo": "bar",
            }),
            Options::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);

    let conn = t.raw();
    assert!(read_revisions(&conn, "foo").is_empty());
    let bodies: i64 = conn
        .query_row(r#"SELECT COUNT(*) FROM "test""#, [], |row| row.get(0))
        .unwrap();
    assert_eq!(bodies, 0);
}
