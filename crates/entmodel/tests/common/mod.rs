#![allow(dead_code)]

use asupersync::runtime::RuntimeBuilder;
use entmodel::prelude::*;
use entmodel::{CustomType, Statement};
use entmodel_memory::{MemoryConnection, MemoryOptions};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn run<F: std::future::Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

/// Case-insensitive text, for comparator tests.
#[derive(Debug)]
pub struct CaseInsensitive;

impl CustomType for CaseInsensitive {
    fn name(&self) -> &str {
        "case_insensitive"
    }

    fn compare(&self, a: &Value, b: &Value) -> bool {
        match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
            _ => a == b,
        }
    }
}

fn id() -> PropertyMetadata {
    PropertyMetadata::new("id", PropertyType::BigInt)
        .primary_key(true)
        .auto_increment(true)
}

/// Authors and books, posts and tags, a self-referencing employee, a
/// single-table vehicle hierarchy and tickets with a generated column.
pub fn registry() -> Arc<MetadataRegistry> {
    let registry = MetadataRegistry::builder()
        .entity(
            EntityMetadata::new("Author")
                .property(id())
                .property(PropertyMetadata::new("name", PropertyType::Text))
                .property(
                    PropertyMetadata::new("email", PropertyType::Text)
                        .nullable(true)
                        .custom_type(Arc::new(CaseInsensitive)),
                )
                .property(PropertyMetadata::new("rating", PropertyType::Decimal).nullable(true))
                .property(
                    PropertyMetadata::new("bio", PropertyType::Text)
                        .nullable(true)
                        .lazy(true),
                )
                .relation(
                    RelationMetadata::one_to_many("books", "Book", "author")
                        .cascade(Cascade::ALL)
                        .orphan_removal(true),
                ),
        )
        .entity(
            EntityMetadata::new("Book")
                .property(id())
                .property(PropertyMetadata::new("title", PropertyType::Text))
                .property(
                    PropertyMetadata::new("status", PropertyType::Text).default_value("draft"),
                )
                .relation(
                    RelationMetadata::many_to_one("author", "Author")
                        .inversed_by("books")
                        .nullable(true),
                )
                .relation(RelationMetadata::many_to_one("sequel", "Book").nullable(true)),
        )
        .entity(
            EntityMetadata::new("Post")
                .property(id())
                .property(PropertyMetadata::new("title", PropertyType::Text))
                .property(PropertyMetadata::new("version", PropertyType::BigInt).version(true))
                .relation(
                    RelationMetadata::many_to_many("tags", "Tag")
                        .inversed_by("posts")
                        .cascade(Cascade::PERSIST),
                ),
        )
        .entity(
            EntityMetadata::new("Tag")
                .property(PropertyMetadata::new("id", PropertyType::BigInt).primary_key(true))
                .property(PropertyMetadata::new("label", PropertyType::Text))
                .relation(RelationMetadata::many_to_many("posts", "Post").mapped_by("tags")),
        )
        .entity(
            EntityMetadata::new("Employee")
                .property(id())
                .property(PropertyMetadata::new("name", PropertyType::Text))
                .relation(RelationMetadata::many_to_one("manager", "Employee").nullable(true)),
        )
        .entity(
            EntityMetadata::new("Vehicle")
                .discriminator_column("kind")
                .discriminator_value("vehicle")
                .property(id())
                .property(PropertyMetadata::new("wheels", PropertyType::Integer)),
        )
        .entity(
            EntityMetadata::new("Car")
                .extends("Vehicle")
                .discriminator_value("car")
                .property(PropertyMetadata::new("seats", PropertyType::Integer)),
        )
        .entity(
            EntityMetadata::new("Truck")
                .extends("Vehicle")
                .discriminator_value("truck")
                .property(PropertyMetadata::new("payload", PropertyType::Integer)),
        )
        .entity(
            EntityMetadata::new("Ticket")
                .property(id())
                .property(PropertyMetadata::new("seq", PropertyType::BigInt).generated(true))
                .property(PropertyMetadata::new("title", PropertyType::Text)),
        )
        .build()
        .expect("build registry");
    Arc::new(registry)
}

pub struct Fixture {
    pub conn: Arc<MemoryConnection>,
    pub session: Session<MemoryConnection>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::build(config, MemoryOptions::default())
    }

    pub fn build(config: SessionConfig, options: MemoryOptions) -> Self {
        let registry = registry();
        let conn = Arc::new(MemoryConnection::with_options(&registry, options));
        let session = Session::with_config(Arc::clone(&conn), registry, config);
        Self { conn, session }
    }

    /// A second session over the same database.
    pub fn other_session(&self) -> Session<MemoryConnection> {
        self.session.fork()
    }

    pub fn entity(&self, entity_type: &str) -> Entity {
        let meta = self
            .session
            .registry()
            .require(entity_type)
            .expect("registered entity");
        Entity::new(meta)
    }

    /// `(kind, table)` of every statement sent so far.
    pub fn statement_summary(&self) -> Vec<(&'static str, String)> {
        self.conn
            .statements()
            .iter()
            .map(|s| (s.kind(), s.table().to_string()))
            .collect()
    }

    pub fn inserts_into(&self, table: &str) -> Vec<Statement> {
        self.conn
            .statements()
            .into_iter()
            .filter(|s| matches!(s, Statement::Insert(i) if i.table == table))
            .collect()
    }
}

pub fn key(id: i64) -> PrimaryKey {
    PrimaryKey::single(id)
}
