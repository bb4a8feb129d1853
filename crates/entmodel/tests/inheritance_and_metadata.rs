//! Single-table inheritance and registry validation through the facade.

mod common;

use common::{Fixture, key, run, unwrap_outcome};
use entmodel::error::MetadataErrorKind;
use entmodel::prelude::*;
use std::sync::Mutex;

fn vehicles(fx: &Fixture) -> (Entity, Entity) {
    let car = fx
        .entity("Car")
        .with("wheels", 4_i32)
        .unwrap()
        .with("seats", 5_i32)
        .unwrap();
    let truck = fx
        .entity("Truck")
        .with("wheels", 6_i32)
        .unwrap()
        .with("payload", 1000_i32)
        .unwrap();
    fx.session.persist(&car).unwrap();
    fx.session.persist(&truck).unwrap();
    (car, truck)
}

#[test]
fn subtypes_share_the_root_table() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (car, truck) = vehicles(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);

        let rows = fx.conn.rows("vehicle");
        assert_eq!(rows.len(), 2);
        let kinds: Vec<_> = rows.iter().map(|r| r.get_by_name("kind").cloned()).collect();
        assert_eq!(
            kinds,
            vec![Some(Value::from("car")), Some(Value::from("truck"))]
        );
        assert_eq!(rows[0].get_by_name("payload"), Some(&Value::Null));
        assert_eq!(car.get("id"), Some(Value::BigInt(1)));
        assert_eq!(truck.get("id"), Some(Value::BigInt(2)));
    });
}

#[test]
fn loading_through_the_root_type_yields_the_concrete_subtype() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        vehicles(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);

        let other = fx.other_session();
        let vehicle = unwrap_outcome(other.find(&cx, "Vehicle", key(1), LockMode::None).await)
            .unwrap();
        assert_eq!(vehicle.entity_type(), "Car");
        assert_eq!(vehicle.get("seats").and_then(|v| v.as_i64()), Some(5));

        // Same identity key space: the managed car answers a subtype lookup.
        let car = unwrap_outcome(other.find(&cx, "Car", key(1), LockMode::None).await).unwrap();
        assert!(car.ptr_eq(&vehicle));

        // A sibling type does not match, managed or not.
        assert!(unwrap_outcome(other.find(&cx, "Truck", key(1), LockMode::None).await).is_none());
        let fresh = fx.other_session();
        assert!(unwrap_outcome(fresh.find(&cx, "Truck", key(1), LockMode::None).await).is_none());
    });
}

#[test]
fn queries_filter_by_discriminator() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        vehicles(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);

        let other = fx.other_session();
        let cars = unwrap_outcome(other.find_by(&cx, "Car", Vec::new()).await);
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0].entity_type(), "Car");

        let all = unwrap_outcome(other.find_by(&cx, "Vehicle", Vec::new()).await);
        assert_eq!(all.len(), 2);
        let types: Vec<_> = all.iter().map(Entity::entity_type).collect();
        assert_eq!(types, vec!["Car", "Truck"]);
        assert!(all[0].ptr_eq(&cars[0]));

        let heavy = unwrap_outcome(
            other
                .find_by(&cx, "Vehicle", vec![Condition::eq("wheels", 6_i32)])
                .await,
        );
        assert_eq!(heavy.len(), 1);
        assert_eq!(heavy[0].entity_type(), "Truck");
    });
}

#[test]
fn hooks_on_a_root_type_fire_for_subtypes() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        fx.session
            .on_entity(
                "Vehicle",
                EventType::BeforeCreate,
                hook_fn(move |args| {
                    if let Some(entity) = args.entity_ref() {
                        sink.lock().unwrap().push(entity.entity_type().to_string());
                    }
                    Ok(())
                }),
            )
            .unwrap();

        vehicles(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);
        assert_eq!(*seen.lock().unwrap(), vec!["Car", "Truck"]);
    });
}

#[test]
fn subtype_updates_touch_only_changed_columns() {
    let cx = Cx::for_testing();
    run(async {
        let fx = Fixture::new();
        let (car, _) = vehicles(&fx);
        unwrap_outcome(fx.session.flush(&cx).await);
        fx.conn.clear_log();

        car.set("seats", 2_i32).unwrap();
        unwrap_outcome(fx.session.flush(&cx).await);
        match fx.conn.statements().as_slice() {
            [entmodel::Statement::Update(update)] => {
                assert_eq!(update.table, "vehicle");
                assert_eq!(update.columns, vec!["seats".to_string()]);
            }
            other => panic!("expected one update, got {other:?}"),
        }
    });
}

#[test]
fn unresolved_relation_targets_are_rejected() {
    let result = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Invoice")
                .property(PropertyMetadata::new("id", PropertyType::BigInt).primary_key(true))
                .relation(RelationMetadata::many_to_one("customer", "Ghost")),
        )
        .build();
    match result {
        Err(Error::Metadata(e)) => {
            assert_eq!(e.kind, MetadataErrorKind::UnresolvedRelation);
            assert_eq!(e.entity, "Invoice");
        }
        Err(other) => panic!("expected metadata error, got {other:?}"),
        Ok(_) => panic!("registry with a dangling relation was accepted"),
    }
}

#[test]
fn subtypes_need_a_discriminator_value() {
    let result = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Shape")
                .discriminator_column("kind")
                .discriminator_value("shape")
                .property(PropertyMetadata::new("id", PropertyType::BigInt).primary_key(true)),
        )
        .entity(EntityMetadata::new("Circle").extends("Shape"))
        .build();
    match result {
        Err(Error::Metadata(e)) => assert_eq!(e.kind, MetadataErrorKind::Inheritance),
        Err(other) => panic!("expected metadata error, got {other:?}"),
        Ok(_) => panic!("subtype without a discriminator value was accepted"),
    }
}

#[test]
fn unknown_names_are_rejected() {
    let fx = Fixture::new();
    let ann = fx.entity("Author");
    match ann.set("nickname", "A") {
        Err(Error::Metadata(e)) => assert_eq!(e.kind, MetadataErrorKind::UnknownProperty),
        other => panic!("expected metadata error, got {other:?}"),
    }
    match fx
        .session
        .on_entity("Ghost", EventType::AfterCreate, hook_fn(|_| Ok(())))
    {
        Err(Error::Metadata(e)) => assert_eq!(e.kind, MetadataErrorKind::UnknownEntity),
        other => panic!("expected metadata error, got {other:?}"),
    }
}
