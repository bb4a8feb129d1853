//! Cascades, dependency ordering, self-references, pivots and lazy relations.

mod common;

use common::{Fixture, expect_err, key, run, unwrap_outcome};
use entmodel::CollectionStatus;
use entmodel::prelude::*;

fn author_with_books(fx: &Fixture, titles: &[&str]) -> (Entity, Vec<Entity>) {
    let author = fx.entity("Author").with("name", "Ann").unwrap();
    let books = titles
        .iter()
        .map(|t| {
            let book = fx.entity("Book").with("title", *t).unwrap();
            author.add("books", &book).unwrap();
            book
        })
        .collect();
    (author, books)
}

#[test]
fn persist_cascades_to_books_after_their_author() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (ann, books) = author_with_books(&fx, &["First"]);
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(
            fx.statement_summary(),
            vec![("insert", "author".to_string()), ("insert", "book".to_string())]
        );
        let rows = fx.conn.rows("book");
        assert_eq!(rows[0].get_by_name("author_id"), ann.get("id").as_ref());
        assert_eq!(fx.session.state_of(&books[0]), EntityState::Managed);
    });
}

#[test]
fn referenced_rows_are_inserted_first_regardless_of_persist_order() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        let book = fx.entity("Book").with("title", "First").unwrap();
        book.set_reference("author", Some(&ann)).unwrap();

        fx.session.persist(&book).unwrap();
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(
            fx.statement_summary(),
            vec![("insert", "author".to_string()), ("insert", "book".to_string())]
        );
        assert_eq!(
            fx.conn.rows("book")[0].get_by_name("author_id"),
            Some(&Value::BigInt(1))
        );
    });
}

#[test]
fn cascade_remove_deletes_books_before_author() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (ann, books) = author_with_books(&fx, &["First", "Second"]);
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        fx.conn.clear_log();

        fx.session.remove(&ann).unwrap();
        let result = unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(result.deleted, 3);

        let summary = fx.statement_summary();
        let (last, rest) = summary.split_last().unwrap();
        assert_eq!(last, &("delete", "author".to_string()));
        assert!(!rest.is_empty());
        assert!(rest.iter().all(|s| s == &("delete", "book".to_string())));

        assert!(fx.conn.rows("author").is_empty());
        assert!(fx.conn.rows("book").is_empty());
        for book in &books {
            assert_eq!(fx.session.state_of(book), EntityState::Detached);
        }
    });
}

#[test]
fn removing_from_an_orphan_removal_collection_deletes_the_item() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (ann, books) = author_with_books(&fx, &["Keep", "Drop"]);
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        fx.conn.clear_log();

        ann.remove_item("books", &books[1]).unwrap();
        assert!(books[1].related("author").is_none());
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(fx.statement_summary(), vec![("delete", "book".to_string())]);
        let rows = fx.conn.rows("book");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("title"), Some(&Value::from("Keep")));
        assert_eq!(fx.session.state_of(&books[1]), EntityState::Detached);
    });
}

#[test]
fn self_reference_with_generated_key_is_written_after_insert() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let boss = fx.entity("Employee").with("name", "Boss").unwrap();
        boss.set_reference("manager", Some(&boss)).unwrap();
        fx.session.persist(&boss).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(
            fx.statement_summary(),
            vec![
                ("insert", "employee".to_string()),
                ("update", "employee".to_string())
            ]
        );
        let row = &fx.conn.rows("employee")[0];
        assert_eq!(row.get_by_name("manager_id"), row.get_by_name("id"));
        assert!(fx.session.compute_change_sets().unwrap().is_empty());
    });
}

#[test]
fn self_reference_with_assigned_key_is_a_single_insert() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let boss = fx
            .entity("Employee")
            .with("id", 7_i64)
            .unwrap()
            .with("name", "Boss")
            .unwrap();
        boss.set_reference("manager", Some(&boss)).unwrap();
        fx.session.persist(&boss).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(fx.statement_summary(), vec![("insert", "employee".to_string())]);
        assert_eq!(
            fx.conn.rows("employee")[0].get_by_name("manager_id"),
            Some(&Value::BigInt(7))
        );
    });
}

#[test]
fn nullable_cycle_is_broken_with_a_deferred_update() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let a = fx.entity("Employee").with("name", "A").unwrap();
        let b = fx.entity("Employee").with("name", "B").unwrap();
        a.set_reference("manager", Some(&b)).unwrap();
        b.set_reference("manager", Some(&a)).unwrap();
        fx.session.persist(&a).unwrap();
        fx.session.persist(&b).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        let summary = fx.statement_summary();
        assert_eq!(summary.iter().filter(|s| s.0 == "insert").count(), 2);
        assert_eq!(summary.iter().filter(|s| s.0 == "update").count(), 1);

        let manager_of = |name: &str| {
            fx.conn
                .rows("employee")
                .into_iter()
                .find(|r| r.get_by_name("name") == Some(&Value::from(name)))
                .and_then(|r| r.get_by_name("manager_id").cloned())
        };
        assert_eq!(manager_of("A"), b.get("id"));
        assert_eq!(manager_of("B"), a.get("id"));
    });
}

#[test]
fn many_to_many_links_live_in_the_pivot_table() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let post = fx.entity("Post").with("title", "Hello").unwrap();
        let rust = fx.entity("Tag").with("id", 1_i64).unwrap().with("label", "rust").unwrap();
        let orm = fx.entity("Tag").with("id", 2_i64).unwrap().with("label", "orm").unwrap();
        post.add("tags", &rust).unwrap();
        post.add("tags", &orm).unwrap();
        assert_eq!(rust.collection("posts").map(|p| p.len()), Some(1));

        fx.session.persist(&post).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(fx.conn.rows("tag").len(), 2);
        let links = fx.conn.rows("post_tags");
        assert_eq!(links.len(), 2);
        assert!(
            links
                .iter()
                .all(|l| l.get_by_name("post_id") == post.get("id").as_ref())
        );

        fx.conn.clear_log();
        post.remove_item("tags", &orm).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(
            fx.statement_summary(),
            vec![
                ("update", "post".to_string()),
                ("delete", "post_tags".to_string())
            ]
        );
        assert_eq!(post.get("version"), Some(Value::BigInt(2)));
        let links = fx.conn.rows("post_tags");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].get_by_name("tag_id"), Some(&Value::BigInt(1)));
    });
}

#[test]
fn collections_load_from_either_side_of_a_pivot() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let post = fx.entity("Post").with("title", "Hello").unwrap();
        let tag = fx.entity("Tag").with("id", 1_i64).unwrap().with("label", "rust").unwrap();
        post.add("tags", &tag).unwrap();
        fx.session.persist(&post).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        let other = fx.other_session();
        let loaded = unwrap_outcome(other.find(&cx, "Post", key(1), LockMode::None).await).unwrap();
        assert_eq!(
            loaded.collection_status("tags"),
            Some(CollectionStatus::Uninitialized)
        );
        let tags = unwrap_outcome(other.load_collection(&cx, &loaded, "tags").await);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].get("label"), Some(Value::from("rust")));

        let posts = unwrap_outcome(other.load_collection(&cx, &tags[0], "posts").await);
        assert_eq!(posts.len(), 1);
        assert!(posts[0].ptr_eq(&loaded));
        assert!(other.compute_change_sets().unwrap().is_empty());
    });
}

#[test]
fn deleting_a_pivot_owner_purges_its_links() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let post = fx.entity("Post").with("title", "Hello").unwrap();
        let tag = fx.entity("Tag").with("id", 1_i64).unwrap().with("label", "rust").unwrap();
        post.add("tags", &tag).unwrap();
        fx.session.persist(&post).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        fx.session.remove(&post).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        assert!(fx.conn.rows("post_tags").is_empty());
        assert!(fx.conn.rows("post").is_empty());
        assert_eq!(fx.conn.rows("tag").len(), 1, "tags are not cascaded on remove");
    });
}

#[test]
fn strict_cascade_rejects_unpersisted_targets() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::with_config(SessionConfig::default().strict_cascade(true));
        let book = fx.entity("Book").with("title", "One").unwrap();
        let sequel = fx.entity("Book").with("title", "Two").unwrap();
        book.set_reference("sequel", Some(&sequel)).unwrap();
        fx.session.persist(&book).unwrap();

        match expect_err(fx.session.flush(&cx).await) {
            Error::Cascade(e) => {
                assert_eq!(e.entity, "Book");
                assert_eq!(e.relation, "sequel");
                assert_eq!(e.target, "Book");
            }
            other => panic!("expected cascade error, got {other:?}"),
        }
        assert!(fx.conn.statements().is_empty());
    });
}

#[test]
fn lenient_cascade_writes_null_for_unpersisted_targets() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let book = fx.entity("Book").with("title", "One").unwrap();
        let sequel = fx.entity("Book").with("title", "Two").unwrap();
        book.set_reference("sequel", Some(&sequel)).unwrap();
        fx.session.persist(&book).unwrap();

        let result = unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(result.inserted, 1);
        let rows = fx.conn.rows("book");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("sequel_id"), Some(&Value::Null));
        assert_eq!(sequel.primary_key(), None);
    });
}

#[test]
fn merge_folds_detached_state_into_the_managed_instance() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let ann = fx.entity("Author").with("name", "Ann").unwrap();
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        ann.set("name", "Ann B.").unwrap();

        let other = fx.other_session();
        let managed = unwrap_outcome(other.merge(&cx, &ann).await);
        assert!(!managed.ptr_eq(&ann));
        assert_eq!(managed.get("name"), Some(Value::from("Ann B.")));
        assert_eq!(other.state_of(&managed), EntityState::Managed);

        fx.conn.clear_log();
        let result = unwrap_outcome(other.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(fx.statement_summary(), vec![("update", "author".to_string())]);
        assert_eq!(
            fx.conn.rows("author")[0].get_by_name("name"),
            Some(&Value::from("Ann B."))
        );
    });
}

#[test]
fn merge_never_links_managed_entities_to_detached_ones() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (ann, books) = author_with_books(&fx, &["First"]);
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        let book = &books[0];
        book.set("title", "Revised").unwrap();

        // The author is outside the merged graph and not managed here.
        let other = fx.other_session();
        let managed = unwrap_outcome(other.merge(&cx, book).await);
        assert!(managed.related("author").is_none());
        let reference = managed.reference("author").flatten().unwrap();
        assert_eq!(reference.key(), Some(key(1)));
        assert_eq!(ann.collection("books").map(|b| b.len()), Some(1));
        assert!(!ann.collection("books").unwrap()[0].ptr_eq(&managed));

        // Once the author is managed, the reference resolves to it.
        let author = unwrap_outcome(other.find(&cx, "Author", key(1), LockMode::None).await)
            .unwrap();
        let again = unwrap_outcome(other.merge(&cx, book).await);
        assert!(again.ptr_eq(&managed));
        assert!(managed.related("author").unwrap().ptr_eq(&author));
        assert!(!author.ptr_eq(&ann));

        let result = unwrap_outcome(other.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(
            fx.conn.rows("book")[0].get_by_name("title"),
            Some(&Value::from("Revised"))
        );
    });
}

#[test]
fn merging_a_keyless_entity_persists_a_copy() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let draft = fx.entity("Author").with("name", "Draft").unwrap();
        let managed = unwrap_outcome(fx.session.merge(&cx, &draft).await);
        assert!(!managed.ptr_eq(&draft));
        assert_eq!(fx.session.state_of(&managed), EntityState::New);
        assert_eq!(fx.session.state_of(&draft), EntityState::Detached);

        unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(managed.get("id"), Some(Value::BigInt(1)));
        assert_eq!(draft.primary_key(), None);
    });
}

#[test]
fn lazy_references_and_collections_load_on_demand() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (ann, _) = author_with_books(&fx, &["First"]);
        fx.session.persist(&ann).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        let other = fx.other_session();
        let book = unwrap_outcome(other.find(&cx, "Book", key(1), LockMode::None).await).unwrap();
        assert!(book.related("author").is_none());
        let author = unwrap_outcome(other.load_reference(&cx, &book, "author").await).unwrap();
        assert_eq!(author.get("name"), Some(Value::from("Ann")));
        assert!(book.related("author").unwrap().ptr_eq(&author));

        // A pending add survives initialization.
        let extra = fx.entity("Book").with("title", "Second").unwrap();
        author.add("books", &extra).unwrap();
        let books = unwrap_outcome(other.load_collection(&cx, &author, "books").await);
        assert_eq!(books.len(), 2);
        assert!(books.iter().any(|b| b.ptr_eq(&book)));
        assert!(books.iter().any(|b| b.ptr_eq(&extra)));

        fx.conn.clear_log();
        unwrap_outcome(other.flush(&cx).await);
        assert_eq!(fx.statement_summary(), vec![("insert", "book".to_string())]);
        assert_eq!(fx.conn.rows("book").len(), 2);
    });
}
