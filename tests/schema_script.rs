use lattice::error::LatticeError;
use lattice::graph::{Engine, Scope};
use lattice::schema::{Catalog, Derived, FieldDef, ModelDef};
use lattice::value::{Value, ValueKind};

#[test]
fn a_script_defines_working_models() {
    let mut catalog = Catalog::new();
    catalog
        .define(
            r#"
            // The mail shape: threads own messages.
            model Thread {
                identified by id;
                attr id: int;
                attr name: text = "General";
                many messages: Message inverse thread;
            }
            model Message {
                attr body: text;
                one thread: Thread inverse messages;
            }
            "#,
        )
        .unwrap();
    let engine = Engine::new(catalog).unwrap();
    let thread = engine.get_or_create("Thread", &[("id", 7.into())]).unwrap();
    assert_eq!(engine.read(thread, "name").unwrap().as_text(), Some("General"));
    let message = engine.create("Message").unwrap();
    engine.link(message, "thread", thread).unwrap();
    assert_eq!(engine.targets(thread, "messages").unwrap(), vec![message]);
}

#[test]
fn computed_marker_accepts_an_attached_closure() {
    let mut catalog = Catalog::new();
    catalog
        .define(
            r#"
            model Thread {
                identified by id;
                attr id: int;
                attr name: text;
                attr display_name: text = "Unnamed" computed;
            }
            "#,
        )
        .unwrap();
    catalog
        .attach_compute("Thread", "display_name", |scope: &mut Scope| {
            let owner = scope.owner();
            match scope.get(owner, "name")? {
                Value::Text(name) => Ok(Derived::Value(Value::Text(format!("#{}", name)))),
                _ => Ok(Derived::Clear),
            }
        })
        .unwrap();
    let engine = Engine::new(catalog).unwrap();
    let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
    assert_eq!(engine.read(thread, "display_name").unwrap().as_text(), Some("Unnamed"));
    engine.write(thread, "name", Value::text("General")).unwrap();
    assert_eq!(engine.read(thread, "display_name").unwrap().as_text(), Some("#General"));
}

#[test]
fn parse_errors_carry_a_location() {
    let mut catalog = Catalog::new();
    let err = catalog.define("model Thread { attr id int; }").unwrap_err();
    match err {
        LatticeError::Parse { line, .. } => assert_eq!(line, Some(1)),
        other => panic!("expected a parse error, got {other}"),
    }
}

#[test]
fn duplicate_models_are_rejected() {
    let mut catalog = Catalog::new();
    catalog.define("model Thread { attr id: int; }").unwrap();
    let err = catalog.define("model Thread { attr id: int; }").unwrap_err();
    assert!(matches!(err, LatticeError::DuplicateModel(_)), "got {err}");
}

#[test]
fn duplicate_fields_are_rejected() {
    let mut catalog = Catalog::new();
    let err = catalog
        .define("model Thread { attr id: int; attr id: text; }")
        .unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn identifying_fields_must_be_declared() {
    let mut catalog = Catalog::new();
    let err = catalog
        .define("model Thread { identified by uuid; attr id: int; }")
        .unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn defaults_must_fit_the_declared_kind() {
    let mut catalog = Catalog::new();
    let err = catalog.define(r#"model Thread { attr id: int = "seven"; }"#).unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn an_inverse_must_exist_on_the_target() {
    let mut catalog = Catalog::new();
    let err = catalog
        .define(
            r#"
            model Thread { many messages: Message inverse thread; }
            model Message { attr body: text; }
            "#,
        )
        .unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn an_inverse_must_point_back() {
    let mut catalog = Catalog::new();
    let err = catalog
        .define(
            r#"
            model Thread { many messages: Message inverse thread; }
            model Other { many messages: Message inverse thread; }
            model Message { one thread: Thread inverse messages; }
            "#,
        )
        .unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn an_inverse_cannot_be_an_attribute() {
    let mut catalog = Catalog::new();
    let err = catalog
        .define(
            r#"
            model Thread { many messages: Message inverse thread; }
            model Message { attr thread: text; }
            "#,
        )
        .unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn mutually_referential_models_register_in_either_order() {
    let mut catalog = Catalog::new();
    catalog
        .define(
            r#"
            model Message { one thread: Thread inverse messages; }
            model Thread { many messages: Message inverse thread; }
            "#,
        )
        .unwrap();
    assert!(Engine::new(catalog).is_ok());
}

#[test]
fn a_relation_to_an_unknown_model_fails_at_seal() {
    let mut catalog = Catalog::new();
    catalog.define("model Thread { many messages: Message; }").unwrap();
    let err = Engine::new(catalog).unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn two_fields_cannot_claim_the_same_inverse() {
    let mut catalog = Catalog::new();
    catalog
        .register(
            ModelDef::new("Thread")
                .field(FieldDef::many("recent", "Message").inverse("thread"))
                .field(FieldDef::many("pinned", "Message").inverse("thread")),
        )
        .unwrap();
    catalog
        .register(ModelDef::new("Message").field(FieldDef::one("thread", "Thread")))
        .unwrap();
    let err = Engine::new(catalog).unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn invalid_identifiers_are_rejected() {
    let mut catalog = Catalog::new();
    let err = catalog.register(ModelDef::new("No Spaces")).unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
    let err = catalog
        .register(ModelDef::new("Thread").field(FieldDef::attr("1id", ValueKind::Integer)))
        .unwrap_err();
    assert!(matches!(err, LatticeError::Schema(_)), "got {err}");
}

#[test]
fn one_sided_inverse_declarations_are_paired_automatically() {
    let mut catalog = Catalog::new();
    catalog
        .define(
            r#"
            model Thread { many messages: Message inverse thread; }
            model Message { one thread: Thread; }
            "#,
        )
        .unwrap();
    let engine = Engine::new(catalog).unwrap();
    let thread = engine.create("Thread").unwrap();
    let message = engine.create("Message").unwrap();
    engine.link(message, "thread", thread).unwrap();
    assert_eq!(engine.targets(thread, "messages").unwrap(), vec![message]);
}
