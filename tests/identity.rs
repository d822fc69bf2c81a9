use std::sync::Arc;

use lattice::error::LatticeError;
use lattice::graph::{Engine, Seed};
use lattice::schema::{Catalog, FieldDef, ModelDef};
use lattice::value::ValueKind;

fn setup() -> Engine {
    let mut catalog = Catalog::new();
    catalog
        .register(
            ModelDef::new("Thread")
                .field(FieldDef::attr("id", ValueKind::Integer))
                .field(FieldDef::attr("name", ValueKind::Text))
                .field(FieldDef::many("messages", "Message").inverse("thread"))
                .identified_by(&["id"]),
        )
        .unwrap();
    catalog
        .register(
            ModelDef::new("Message")
                .field(FieldDef::attr("body", ValueKind::Text))
                .field(FieldDef::one("thread", "Thread").inverse("messages")),
        )
        .unwrap();
    Engine::new(catalog).unwrap()
}

#[test]
fn same_key_returns_same_record() {
    let engine = setup();
    let first = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let second = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.live_records("Thread").unwrap().len(), 1);
}

#[test]
fn different_keys_allocate_distinct_records() {
    let engine = setup();
    let one = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let two = engine.get_or_create("Thread", &[("id", 2.into())]).unwrap();
    assert_ne!(one, two);
    assert_eq!(engine.live_records("Thread").unwrap().len(), 2);
}

#[test]
fn identity_hit_leaves_record_unchanged() {
    let engine = setup();
    let thread = engine
        .get_or_create("Thread", &[("id", 1.into()), ("name", "general".into())])
        .unwrap();
    // Seeds on an identity hit are ignored; the existing record comes back as is.
    let again = engine
        .get_or_create("Thread", &[("id", 1.into()), ("name", "other".into())])
        .unwrap();
    assert_eq!(thread, again);
    assert_eq!(engine.read(thread, "name").unwrap().as_text(), Some("general"));
}

#[test]
fn missing_identifying_value_is_rejected() {
    let engine = setup();
    let err = engine.get_or_create("Thread", &[("name", "general".into())]).unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn non_singleton_models_always_allocate() {
    let engine = setup();
    let one = engine.get_or_create("Message", &[]).unwrap();
    let two = engine.get_or_create("Message", &[]).unwrap();
    assert_ne!(one, two);
}

#[test]
fn create_is_refused_for_singleton_models() {
    let engine = setup();
    let err = engine.create("Thread").unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn records_identified_by_a_relation() {
    let mut catalog = Catalog::new();
    catalog
        .register(
            ModelDef::new("User").field(FieldDef::many("profiles", "Profile").inverse("owner")),
        )
        .unwrap();
    catalog
        .register(
            ModelDef::new("Profile")
                .field(FieldDef::one("owner", "User").inverse("profiles"))
                .identified_by(&["owner"]),
        )
        .unwrap();
    let engine = Engine::new(catalog).unwrap();

    let user = engine.create("User").unwrap();
    let profile = engine.get_or_create("Profile", &[("owner", Seed::record(user))]).unwrap();
    // Construction established the inverse link.
    assert_eq!(engine.targets(user, "profiles").unwrap(), vec![profile]);
    let again = engine.get_or_create("Profile", &[("owner", Seed::record(user))]).unwrap();
    assert_eq!(profile, again);

    let other = engine.create("User").unwrap();
    let second = engine.get_or_create("Profile", &[("owner", Seed::record(other))]).unwrap();
    assert_ne!(profile, second);
}

#[test]
fn seed_of_the_wrong_kind_is_rejected() {
    let engine = setup();
    let err = engine.get_or_create("Thread", &[("id", "one".into())]).unwrap_err();
    assert!(matches!(err, LatticeError::ValueMismatch { .. }), "got {err}");
}

#[test]
fn concurrent_construction_yields_one_record() {
    let engine = Arc::new(setup());
    let mut workers = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        workers.push(std::thread::spawn(move || {
            engine.get_or_create("Thread", &[("id", 42.into())]).unwrap()
        }));
    }
    let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(engine.live_records("Thread").unwrap().len(), 1);
}
