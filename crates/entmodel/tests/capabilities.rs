//! Statement shapes under restricted driver capabilities.

mod common;

use common::{Fixture, key, run, unwrap_outcome};
use entmodel::prelude::*;
use entmodel::{Capabilities, Statement};
use entmodel_memory::MemoryOptions;

fn fixture(capabilities: Capabilities) -> Fixture {
    Fixture::build(
        SessionConfig::default(),
        MemoryOptions::default().capabilities(capabilities),
    )
}

fn insert_rows(statements: &[Statement]) -> Vec<usize> {
    statements.iter().map(Statement::row_count).collect()
}

fn tickets(fx: &Fixture) -> (Entity, Entity) {
    let a = fx.entity("Ticket").with("title", "a").unwrap();
    let b = fx.entity("Ticket").with("title", "b").unwrap();
    fx.session.persist(&a).unwrap();
    fx.session.persist(&b).unwrap();
    (a, b)
}

#[test]
fn returning_hands_back_keys_and_generated_columns() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (a, b) = tickets(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);

        match fx.inserts_into("ticket").as_slice() {
            [Statement::Insert(insert)] => {
                assert_eq!(insert.rows.len(), 2);
                assert_eq!(insert.returning, vec!["id".to_string(), "seq".to_string()]);
            }
            other => panic!("expected one insert, got {other:?}"),
        }
        assert!(fx.conn.reads().is_empty());
        assert_eq!(a.get("seq"), Some(Value::BigInt(1)));
        assert_eq!(b.get("id"), Some(Value::BigInt(2)));
    });
}

#[test]
fn sequential_ids_key_a_multi_row_insert_and_generated_columns_are_read_back() {
    let cx = Cx::for_testing();
    run(async {
        let fx = fixture(Capabilities {
            returning: false,
            ..Capabilities::all()
        });
        let (a, b) = tickets(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(insert_rows(&fx.inserts_into("ticket")), vec![2]);
        assert_eq!(a.get("id"), Some(Value::BigInt(1)));
        assert_eq!(b.get("id"), Some(Value::BigInt(2)));

        // One keyed read per row for the column the insert could not return.
        assert_eq!(fx.conn.reads().len(), 2);
        assert_eq!(a.get("seq"), Some(Value::BigInt(1)));
        assert_eq!(b.get("seq"), Some(Value::BigInt(2)));
    });
}

#[test]
fn without_returning_or_sequential_ids_rows_are_inserted_one_by_one() {
    let cx = Cx::for_testing();
    run(async {
        let fx = fixture(Capabilities {
            returning: false,
            sequential_insert_ids: false,
            ..Capabilities::all()
        });
        let (a, b) = tickets(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(insert_rows(&fx.inserts_into("ticket")), vec![1, 1]);
        let rows = fx.conn.rows("ticket");
        assert_eq!(a.get("id").as_ref(), rows[0].get_by_name("id"));
        assert_eq!(b.get("id").as_ref(), rows[1].get_by_name("id"));
        assert_eq!(b.get("seq").as_ref(), rows[1].get_by_name("seq"));

        let found = unwrap_outcome(fx.session.find(&cx, "Ticket", key(2), LockMode::None).await)
            .unwrap();
        assert!(found.ptr_eq(&b));

        b.set("title", "b2").unwrap();
        let result = unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(
            fx.conn.rows("ticket")[1].get_by_name("title"),
            Some(&Value::from("b2"))
        );
    });
}

#[test]
fn single_row_statements_when_batching_is_unsupported() {
    let cx = Cx::for_testing();
    run(async {
        let fx = fixture(Capabilities::default());
        let authors: Vec<_> = ["Ann", "Bob", "Cy"]
            .into_iter()
            .map(|name| fx.entity("Author").with("name", name).unwrap())
            .collect();
        for author in &authors {
            fx.session.persist(author).unwrap();
        }
        let post = fx.entity("Post").with("title", "Hello").unwrap();
        for (id, label) in [(1_i64, "rust"), (2, "orm")] {
            let tag = fx.entity("Tag").with("id", id).unwrap().with("label", label).unwrap();
            post.add("tags", &tag).unwrap();
        }
        fx.session.persist(&post).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(insert_rows(&fx.inserts_into("author")), vec![1, 1, 1]);
        assert_eq!(insert_rows(&fx.inserts_into("post_tags")), vec![1, 1]);
        let ids: Vec<_> = authors.iter().map(|a| a.get("id")).collect();
        assert_eq!(
            ids,
            vec![
                Some(Value::BigInt(1)),
                Some(Value::BigInt(2)),
                Some(Value::BigInt(3))
            ]
        );

        fx.conn.clear_log();
        authors[0].set("name", "Anne").unwrap();
        authors[1].set("name", "Bobby").unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(
            fx.statement_summary(),
            vec![
                ("update", "author".to_string()),
                ("update", "author".to_string())
            ]
        );

        fx.conn.clear_log();
        fx.session.remove(&authors[0]).unwrap();
        fx.session.remove(&authors[1]).unwrap();
        let result = unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(result.deleted, 2);
        assert_eq!(
            fx.statement_summary(),
            vec![
                ("delete", "author".to_string()),
                ("delete", "author".to_string())
            ]
        );
        assert_eq!(fx.conn.rows("author").len(), 1);
    });
}

#[test]
fn batches_split_at_the_configured_size() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::with_config(SessionConfig::default().batch_size(2));
        for title in ["a", "b", "c", "d", "e"] {
            let book = fx.entity("Book").with("title", title).unwrap();
            fx.session.persist(&book).unwrap();
        }
        let result = unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(result.inserted, 5);
        assert_eq!(insert_rows(&fx.inserts_into("book")), vec![2, 2, 1]);
    });
}

#[test]
fn a_row_referencing_its_batch_starts_a_new_statement() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let first = fx.entity("Book").with("title", "One").unwrap();
        fx.session.persist(&first).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        fx.conn.clear_log();

        // Same columns, but the second row needs the first row's key.
        let second = fx.entity("Book").with("title", "Two").unwrap();
        second.set_reference("sequel", Some(&first)).unwrap();
        let third = fx.entity("Book").with("title", "Three").unwrap();
        third.set_reference("sequel", Some(&second)).unwrap();
        fx.session.persist(&second).unwrap();
        fx.session.persist(&third).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);

        assert_eq!(insert_rows(&fx.inserts_into("book")), vec![1, 1]);
        let rows = fx.conn.rows("book");
        assert_eq!(rows[1].get_by_name("sequel_id"), Some(&Value::BigInt(1)));
        assert_eq!(rows[2].get_by_name("sequel_id"), Some(&Value::BigInt(2)));
        assert_eq!(third.get("id"), Some(Value::BigInt(3)));
    });
}
