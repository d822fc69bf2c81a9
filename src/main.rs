//! Demo binary: loads settings and either reports on a schema script given
//! as the first argument, or walks through a small built-in scenario.
//!
//! `RUST_LOG=lattice=debug cargo run` shows the engine's tracing output.

use std::env;
use std::fs;

use tracing::info;
use tracing_subscriber::EnvFilter;

use lattice::error::{LatticeError, Result};
use lattice::graph::{Engine, Scope};
use lattice::schema::{Catalog, Derived};
use lattice::settings::Settings;
use lattice::value::Value;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let settings = Settings::load()?;

    if let Some(path) = env::args().nth(1) {
        let script = fs::read_to_string(&path)
            .map_err(|e| LatticeError::Config(format!("cannot read '{}': {}", path, e)))?;
        let mut catalog = Catalog::new();
        catalog.define(&script)?;
        let models = catalog.len();
        Engine::with_settings(catalog, settings)?;
        info!(script = %path, models, "schema loaded and sealed");
        return Ok(());
    }

    demo(settings)
}

fn demo(settings: Settings) -> Result<()> {
    let mut catalog = Catalog::new();
    catalog.define(
        r#"
        model Thread {
            identified by id;
            attr id: int;
            attr name: text;
            attr display_name: text = "Unnamed" computed;
            many messages: Message inverse thread;
        }
        model Message {
            attr body: text;
            one thread: Thread inverse messages;
        }
        "#,
    )?;
    catalog.attach_compute("Thread", "display_name", |scope: &mut Scope| {
        let owner = scope.owner();
        match scope.get(owner, "name")? {
            Value::Text(name) => Ok(Derived::Value(Value::Text(format!("#{}", name)))),
            _ => Ok(Derived::Clear),
        }
    })?;
    let engine = Engine::with_settings(catalog, settings)?;

    let thread = engine.get_or_create("Thread", &[("id", 1.into())])?;
    let shown = engine.read(thread, "display_name")?;
    info!(thread, display = %shown, "fresh thread");

    engine.write(thread, "name", Value::text("General"))?;
    let shown = engine.read(thread, "display_name")?;
    info!(thread, display = %shown, "after naming");

    let message = engine.create("Message")?;
    engine.write(message, "body", Value::text("hello"))?;
    engine.link(message, "thread", thread)?;
    let messages = engine.targets(thread, "messages")?.len();
    info!(messages, "thread picked up the message through the inverse");

    engine.destroy(message)?;
    let messages = engine.targets(thread, "messages")?.len();
    info!(messages, "message destroyed, relation retracted");
    Ok(())
}
