use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use lattice::graph::{Engine, Scope};
use lattice::schema::{Catalog, Derived, FieldDef, ModelDef};
use lattice::value::{Value, ValueKind};

fn engine() -> Engine {
    let mut catalog = Catalog::new();
    catalog
        .register(
            ModelDef::new("Thread")
                .field(FieldDef::attr("id", ValueKind::Integer))
                .field(FieldDef::attr("name", ValueKind::Text))
                .field(
                    FieldDef::attr("display_name", ValueKind::Text)
                        .default(Value::text("Unnamed"))
                        .compute(|scope: &mut Scope| {
                            let owner = scope.owner();
                            match scope.get(owner, "name")? {
                                Value::Text(name) => {
                                    Ok(Derived::Value(Value::Text(format!("#{}", name))))
                                }
                                _ => Ok(Derived::Clear),
                            }
                        }),
                )
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

pub fn criterion_benchmark(c: &mut Criterion) {
    let engine = engine();
    for id in 0..1_000i64 {
        engine.get_or_create("Thread", &[("id", id.into())]).unwrap();
    }
    c.bench_function("identity hit 1k", |b| {
        b.iter(|| {
            engine
                .get_or_create("Thread", &[("id", black_box(500i64).into())])
                .unwrap()
        })
    });

    let thread = engine.get_or_create("Thread", &[("id", 0.into())]).unwrap();
    let message = engine.create("Message").unwrap();
    c.bench_function("link/unlink round", |b| {
        b.iter(|| {
            engine.link(message, "thread", thread).unwrap();
            engine.unlink(message, "thread", thread).unwrap();
        })
    });

    let mut counter = 0i64;
    c.bench_function("dirty write + computed read", |b| {
        b.iter(|| {
            counter += 1;
            engine
                .write(thread, "name", Value::Text(format!("name-{}", counter)))
                .unwrap();
            black_box(engine.read(thread, "display_name").unwrap())
        })
    });

    let fanout = engine.get_or_create("Thread", &[("id", 1_000_000.into())]).unwrap();
    let messages: Vec<_> = (0..1_000).map(|_| engine.create("Message").unwrap()).collect();
    c.bench_function("fan-in link 1k", |b| {
        b.iter(|| {
            for m in &messages {
                engine.link(*m, "thread", fanout).unwrap();
            }
            engine.clear_relation(fanout, "messages").unwrap();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
