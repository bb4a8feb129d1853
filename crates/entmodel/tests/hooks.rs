//! Lifecycle hooks around a flush.

mod common;

use common::{Fixture, expect_err, run, unwrap_outcome};
use entmodel::prelude::*;
use entmodel_memory::MemoryConnection;
use std::sync::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

fn recorder(log: &Log, tag: &'static str) -> Arc<dyn entmodel::Hook> {
    let log = Arc::clone(log);
    hook_fn(move |_| {
        log.lock().unwrap().push(tag.to_string());
        Ok(())
    })
}

#[test]
fn entity_hooks_run_before_session_hooks() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let log: Log = Arc::default();
        fx.session.on(EventType::BeforeCreate, recorder(&log, "session"));
        fx.session
            .on_entity("Author", EventType::BeforeCreate, recorder(&log, "author"))
            .unwrap();
        fx.session.on(EventType::BeforeFlush, recorder(&log, "before_flush"));
        fx.session.on(EventType::AfterFlush, recorder(&log, "after_flush"));

        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["before_flush", "author", "session", "after_flush"]
        );
    });
}

#[test]
fn before_create_changes_are_written() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        fx.session
            .on_entity(
                "Book",
                EventType::BeforeCreate,
                hook_fn(|args| {
                    let book = args.entity_ref().unwrap();
                    let title = book.get("title").and_then(|v| v.as_str().map(str::to_uppercase));
                    book.set("title", title.unwrap_or_default())?;
                    book.set("status", "review")
                }),
            )
            .unwrap();

        let book = fx.entity("Book").with("title", "dune").unwrap();
        fx.session.persist(&book).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        let row = &fx.conn.rows("book")[0];
        assert_eq!(row.get_by_name("title"), Some(&Value::from("DUNE")));
        assert_eq!(row.get_by_name("status"), Some(&Value::from("review")));
        assert!(fx.session.compute_change_sets().unwrap().is_empty());
    });
}

#[test]
fn failing_before_hook_aborts_the_flush() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        fx.session
            .on_entity(
                "Book",
                EventType::BeforeCreate,
                hook_fn(|_| Err(Error::Custom("books are closed".into()))),
            )
            .unwrap();

        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        let book = fx.entity("Book").with("title", "First").unwrap();
        ann.add("books", &book).unwrap();
        fx.session.persist(&ann).unwrap();

        match expect_err(fx.session.flush(&cx).await) {
            Error::Hook(e) => {
                assert_eq!(e.event, "before_create");
                assert_eq!(e.entity.as_deref(), Some("Book"));
                assert!(e.message.contains("books are closed"));
            }
            other => panic!("expected hook error, got {other:?}"),
        }
        assert!(fx.conn.rows("author").is_empty());
        assert!(!fx.conn.in_transaction());
        assert_eq!(fx.session.state_of(&ann), EntityState::New);
        assert_eq!(ann.primary_key(), None);
    });
}

#[test]
fn failing_before_flush_hook_sends_nothing() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        fx.session.on(
            EventType::BeforeFlush,
            hook_fn(|args| {
                assert_eq!(args.change_sets.len(), 1);
                Err(Error::Custom("read-only".into()))
            }),
        );
        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        fx.session.persist(&ann).unwrap();

        match expect_err(fx.session.flush(&cx).await) {
            Error::Hook(e) => {
                assert_eq!(e.event, "before_flush");
                assert_eq!(e.entity, None);
            }
            other => panic!("expected hook error, got {other:?}"),
        }
        assert!(fx.conn.statements().is_empty());
        assert!(!fx.conn.in_transaction());
    });
}

#[test]
fn after_hooks_see_committed_state() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let conn = Arc::clone(&fx.conn);
        fx.session
            .on_entity(
                "Author",
                EventType::AfterCreate,
                hook_fn(move |args| {
                    assert!(!conn.in_transaction());
                    sink.lock()
                        .unwrap()
                        .push(args.entity_ref().and_then(|e| e.get("id")));
                    Ok(())
                }),
            )
            .unwrap();

        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(*seen.lock().unwrap(), vec![Some(Value::BigInt(1))]);
    });
}

#[test]
fn failing_after_flush_hook_keeps_the_commit() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        fx.session.on(
            EventType::AfterFlush,
            hook_fn(|_| Err(Error::Custom("notify failed".into()))),
        );
        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        fx.session.persist(&ann).unwrap();

        match expect_err(fx.session.flush(&cx).await) {
            Error::Hook(e) => assert_eq!(e.event, "after_flush"),
            other => panic!("expected hook error, got {other:?}"),
        }
        assert_eq!(fx.conn.rows("author").len(), 1);
        assert_eq!(fx.session.state_of(&ann), EntityState::Managed);
        assert!(fx.session.compute_change_sets().unwrap().is_empty());
    });
}

#[test]
fn update_and_delete_hooks_fire_per_change_set() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let log: Log = Arc::default();
        for (event, tag) in [
            (EventType::BeforeUpdate, "before_update"),
            (EventType::AfterUpdate, "after_update"),
            (EventType::BeforeDelete, "before_delete"),
            (EventType::AfterDelete, "after_delete"),
        ] {
            fx.session.on_entity("Author", event, recorder(&log, tag)).unwrap();
        }

        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        let bob = fx.entity("Author").with("name", "Bob").unwrap();
        fx.session.persist(&ann).unwrap();
        fx.session.persist(&bob).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        assert!(log.lock().unwrap().is_empty());

        ann.set("name", "Anne").unwrap();
        fx.session.remove(&bob).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before_update", "before_delete", "after_update", "after_delete"]
        );
    });
}

#[test]
fn metadata_hooks_reach_every_session() {
    let cx = Cx::for_testing();
    run(async {
        let log: Log = Arc::default();
        let registry = MetadataRegistry::builder()
            .entity(
                EntityMetadata::new("Note")
                    .property(
                        PropertyMetadata::new("id", PropertyType::BigInt)
                            .primary_key(true)
                            .auto_increment(true),
                    )
                    .property(PropertyMetadata::new("body", PropertyType::Text))
                    .hook(EventType::BeforeCreate, recorder(&log, "declared")),
            )
            .build()
            .unwrap();
        let registry = Arc::new(registry);
        let conn = Arc::new(MemoryConnection::from_registry(&registry));

        let first = Session::new(Arc::clone(&conn), Arc::clone(&registry));
        let second = Session::new(Arc::clone(&conn), Arc::clone(&registry));
        second
            .on_entity("Note", EventType::BeforeCreate, recorder(&log, "session_entity"))
            .unwrap();
        second.on(EventType::BeforeCreate, recorder(&log, "session"));

        let meta = registry.require("Note").unwrap();
        let a = Entity::new(meta).with("body", "a").unwrap();
        first.persist(&a).unwrap();
        unwrap_outcome(first.flush(&cx).await);
        assert_eq!(*log.lock().unwrap(), vec!["declared"]);

        log.lock().unwrap().clear();
        let b = Entity::new(meta).with("body", "b").unwrap();
        second.persist(&b).unwrap();
        unwrap_outcome(second.flush(&cx).await);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["declared", "session_entity", "session"]
        );
        assert_eq!(conn.rows("note").len(), 2);
    });
}
