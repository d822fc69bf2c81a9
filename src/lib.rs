//! Lattice – a reactive record graph for keeping application state models
//! consistent.
//!
//! Lattice centers on the *record* concept: an instance of a registered
//! model, holding attribute values and relations to other records, where:
//! * A [`schema::ModelDef`] names a model and declares its fields.
//! * A [`schema::FieldDef`] declares an attribute, a single relation, or a
//!   multi relation, optionally with a default, an inverse, or a computation.
//! * A [`graph::Handle`] is an opaque record identity (a simple `u64`).
//! * An [`graph::IdentityKey`] is the canonicalized identifying tuple that
//!   makes records of some models unique.
//!
//! Relations with a declared inverse are kept bidirectionally consistent by
//! the engine on every mutation: linking a message to a thread makes the
//! thread list the message, and unlinking retracts both sides in one step.
//! Computed fields record what they read and are recomputed lazily, exactly
//! once, when read after any dependency changed.
//!
//! ## Modules
//! * [`schema`] – Field descriptors, model definitions, and the catalog that
//!   validates and seals them.
//! * [`graph`] – The engine: record arena, identity maps, relation edges,
//!   mutation commands, and destruction.
//! * [`value`] – The closed attribute value set (text, numbers, times, JSON)
//!   and its kinds.
//! * [`dsl`] – A small schema definition language (grammar in `schema.pest`).
//! * [`snapshot`] – Checksummed JSON export/import of the live graph.
//! * [`session`] – Batch submission with cancellation; one batch settles
//!   fully before the next starts.
//! * [`settings`] – Operational knobs from file/environment.
//!
//! ## Quick Start
//! ```
//! use lattice::graph::Engine;
//! use lattice::schema::Catalog;
//!
//! let mut catalog = Catalog::new();
//! catalog.define(r#"
//!     model Thread {
//!         identified by id;
//!         attr id: int;
//!         attr name: text = "General";
//!         many messages: Message inverse thread;
//!     }
//!     model Message {
//!         attr body: text;
//!         one thread: Thread inverse messages;
//!     }
//! "#).unwrap();
//! let engine = Engine::new(catalog).unwrap();
//!
//! let thread = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
//! let message = engine.create("Message").unwrap();
//! engine.link(message, "thread", thread).unwrap();
//! assert_eq!(engine.targets(thread, "messages").unwrap(), vec![message]);
//!
//! // Identifying tuples are unique: the same key yields the same record.
//! let again = engine.get_or_create("Thread", &[("id", 1.into())]).unwrap();
//! assert_eq!(thread, again);
//! ```
//!
//! ## Computed fields
//! Computations are plain closures attached to declared fields. They read
//! through a [`graph::Scope`], which records every read as a dependency;
//! returning [`schema::Derived::Clear`] resets the field to its default.
//! A failing computation surfaces as an error to the triggering reader only
//! and leaves the previously cached value in place.
//!
//! ## Status
//! The mutation and computation surfaces are settled; the snapshot format
//! may still grow a migration story. Expect additive changes.

pub mod dsl;
pub mod error;
pub mod graph;
pub(crate) mod reactive;
pub mod schema;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod value;
