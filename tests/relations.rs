use lattice::error::LatticeError;
use lattice::graph::{Engine, MutationCommand};
use lattice::schema::{Catalog, FieldDef, ModelDef};
use lattice::value::{Value, ValueKind};

fn setup() -> Engine {
    let mut catalog = Catalog::new();
    catalog
        .register(
            ModelDef::new("Thread")
                .field(FieldDef::attr("id", ValueKind::Integer))
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
fn link_establishes_the_inverse() {
    let engine = setup();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let message = engine.create("Message").unwrap();
    engine.link(thread, "messages", message).unwrap();
    assert_eq!(engine.target(message, "thread").unwrap(), Some(thread));
    assert_eq!(engine.targets(thread, "messages").unwrap(), vec![message]);
}

#[test]
fn unlink_retracts_both_sides() {
    let engine = setup();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let message = engine.create("Message").unwrap();
    engine.link(message, "thread", thread).unwrap();
    engine.unlink(thread, "messages", message).unwrap();
    assert_eq!(engine.target(message, "thread").unwrap(), None);
    assert!(engine.targets(thread, "messages").unwrap().is_empty());
    // The message itself is untouched; unlinking is not destruction.
    assert!(engine.is_alive(message));
}

#[test]
fn linking_twice_is_idempotent() {
    let engine = setup();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let message = engine.create("Message").unwrap();
    engine.link(thread, "messages", message).unwrap();
    engine.link(thread, "messages", message).unwrap();
    assert_eq!(engine.targets(thread, "messages").unwrap().len(), 1);
}

#[test]
fn unlink_of_an_absent_edge_is_a_noop() {
    let engine = setup();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let message = engine.create("Message").unwrap();
    engine.unlink(thread, "messages", message).unwrap();
    assert!(engine.targets(thread, "messages").unwrap().is_empty());
}

#[test]
fn relinking_a_single_relation_moves_the_record() {
    let engine = setup();
    let old = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let new = engine.get_or_create("Thread", &[("id", 2.into())]).unwrap();
    let message = engine.create("Message").unwrap();
    engine.link(message, "thread", old).unwrap();
    engine.replace(message, "thread", new).unwrap();
    assert_eq!(engine.target(message, "thread").unwrap(), Some(new));
    assert!(engine.targets(old, "messages").unwrap().is_empty());
    assert_eq!(engine.targets(new, "messages").unwrap(), vec![message]);
}

#[test]
fn replace_on_a_multi_relation_keeps_only_the_target() {
    let engine = setup();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let first = engine.create("Message").unwrap();
    let second = engine.create("Message").unwrap();
    engine.link(thread, "messages", first).unwrap();
    engine.link(thread, "messages", second).unwrap();
    engine.apply(thread, "messages", MutationCommand::Replace(second)).unwrap();
    assert_eq!(engine.targets(thread, "messages").unwrap(), vec![second]);
    assert_eq!(engine.target(first, "thread").unwrap(), None);
}

#[test]
fn clear_unlinks_every_target() {
    let engine = setup();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let first = engine.create("Message").unwrap();
    let second = engine.create("Message").unwrap();
    engine.link(thread, "messages", first).unwrap();
    engine.link(thread, "messages", second).unwrap();
    engine.clear_relation(thread, "messages").unwrap();
    assert!(engine.targets(thread, "messages").unwrap().is_empty());
    assert_eq!(engine.target(first, "thread").unwrap(), None);
    assert_eq!(engine.target(second, "thread").unwrap(), None);
}

// An exclusive pair on both sides: linking steals the occupant.
fn one_to_one() -> Engine {
    let mut catalog = Catalog::new();
    catalog
        .register(ModelDef::new("User").field(FieldDef::one("profile", "Profile").inverse("owner")))
        .unwrap();
    catalog
        .register(ModelDef::new("Profile").field(FieldDef::one("owner", "User").inverse("profile")))
        .unwrap();
    Engine::new(catalog).unwrap()
}

#[test]
fn occupied_single_inverse_is_displaced() {
    let engine = one_to_one();
    let alice = engine.create("User").unwrap();
    let bob = engine.create("User").unwrap();
    let profile = engine.create("Profile").unwrap();
    engine.link(alice, "profile", profile).unwrap();
    engine.link(bob, "profile", profile).unwrap();
    assert_eq!(engine.target(profile, "owner").unwrap(), Some(bob));
    assert_eq!(engine.target(alice, "profile").unwrap(), None);
}

#[test]
fn self_referential_links_do_not_recurse() {
    let mut catalog = Catalog::new();
    catalog
        .register(
            ModelDef::new("Node")
                .field(FieldDef::one("parent", "Node").inverse("children"))
                .field(FieldDef::many("children", "Node").inverse("parent")),
        )
        .unwrap();
    let engine = Engine::new(catalog).unwrap();
    let node = engine.create("Node").unwrap();
    // A record may appear on both ends of its own edge.
    engine.link(node, "parent", node).unwrap();
    assert_eq!(engine.target(node, "parent").unwrap(), Some(node));
    assert_eq!(engine.targets(node, "children").unwrap(), vec![node]);
    engine.unlink(node, "parent", node).unwrap();
    assert_eq!(engine.target(node, "parent").unwrap(), None);
    assert!(engine.targets(node, "children").unwrap().is_empty());
}

#[test]
fn cyclic_graphs_are_legal() {
    let mut catalog = Catalog::new();
    catalog
        .register(
            ModelDef::new("Node")
                .field(FieldDef::one("parent", "Node").inverse("children"))
                .field(FieldDef::many("children", "Node").inverse("parent")),
        )
        .unwrap();
    let engine = Engine::new(catalog).unwrap();
    let a = engine.create("Node").unwrap();
    let b = engine.create("Node").unwrap();
    engine.link(a, "parent", b).unwrap();
    engine.link(b, "parent", a).unwrap();
    assert_eq!(engine.targets(a, "children").unwrap(), vec![b]);
    assert_eq!(engine.targets(b, "children").unwrap(), vec![a]);
}

#[test]
fn linking_the_wrong_model_is_rejected() {
    let engine = setup();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    let other = engine.get_or_create("Thread", &[("id", 2.into())]).unwrap();
    let err = engine.link(thread, "messages", other).unwrap_err();
    assert!(matches!(err, LatticeError::InverseMaintenance(_)), "got {err}");
    // Nothing changed.
    assert!(engine.targets(thread, "messages").unwrap().is_empty());
}

#[test]
fn relation_fields_reject_attribute_writes() {
    let engine = setup();
    let message = engine.create("Message").unwrap();
    let err = engine.write(message, "thread", Value::Integer(1)).unwrap_err();
    assert!(matches!(err, LatticeError::IllegalMutation(_)), "got {err}");
}

#[test]
fn attribute_fields_reject_link_commands() {
    let engine = setup();
    let message = engine.create("Message").unwrap();
    let other = engine.create("Message").unwrap();
    let err = engine.link(message, "body", other).unwrap_err();
    assert!(matches!(err, LatticeError::IllegalMutation(_)), "got {err}");
}

#[test]
fn identifying_relations_are_frozen_after_construction() {
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
    let other = engine.create("User").unwrap();
    let profile = engine
        .get_or_create("Profile", &[("owner", lattice::graph::Seed::record(user))])
        .unwrap();
    let err = engine.replace(profile, "owner", other).unwrap_err();
    assert!(matches!(err, LatticeError::IllegalMutation(_)), "got {err}");
    assert_eq!(engine.target(profile, "owner").unwrap(), Some(user));
}
