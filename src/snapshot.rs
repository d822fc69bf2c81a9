//! Whole-graph snapshots.
//!
//! A snapshot is a JSON document carrying every live record (attribute
//! values and forward relation lists under their original handles) plus a
//! blake3 checksum of the canonical payload, so a tampered or truncated
//! snapshot is rejected before any of it is adopted. Import rebuilds the
//! identity maps from the identifying slots and re-checks bidirectional
//! consistency; computations are not stored, they re-run on first read.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LatticeError, Result};
use crate::graph::{Engine, Handle, IdentityKey, KeyPart, Slot};
use crate::schema::{Catalog, FieldWiring};
use crate::settings::Settings;
use crate::value::Value;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    body: Body,
}

#[derive(Serialize, Deserialize)]
struct Body {
    version: u32,
    records: Vec<RecordSnap>,
}

#[derive(Serialize, Deserialize)]
struct RecordSnap {
    handle: Handle,
    model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attrs: Vec<(String, Value)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ones: Vec<(String, Handle)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    manys: Vec<(String, Vec<Handle>)>,
}

/// Serialize the live graph.
pub fn export(engine: &Engine) -> Result<String> {
    let core = engine.lock()?;
    let mut records = Vec::new();
    for (model_id, ms) in core.schema.models() {
        for handle in core.live[model_id as usize].iter() {
            let record = core
                .records
                .get(&handle)
                .ok_or_else(|| LatticeError::Invariant("live set out of sync".to_owned()))?;
            let mut snap = RecordSnap {
                handle,
                model: ms.name().to_owned(),
                attrs: Vec::new(),
                ones: Vec::new(),
                manys: Vec::new(),
            };
            for (fid, meta) in ms.fields() {
                match &record.slots[fid as usize] {
                    Slot::Attr(Some(value)) => {
                        snap.attrs.push((meta.name().to_owned(), value.clone()));
                    }
                    Slot::One(Some(target)) => {
                        snap.ones.push((meta.name().to_owned(), *target));
                    }
                    Slot::Many(targets) if !targets.is_empty() => {
                        snap.manys.push((meta.name().to_owned(), targets.clone()));
                    }
                    _ => (),
                }
            }
            records.push(snap);
        }
    }
    // Handle order makes the payload, and thereby the checksum, canonical.
    records.sort_by_key(|r| r.handle);
    let count = records.len();
    let body = Body { version: FORMAT_VERSION, records };
    let payload = serde_json::to_string(&body).map_err(|e| LatticeError::Snapshot(e.to_string()))?;
    let checksum = blake3::hash(payload.as_bytes()).to_hex().to_string();
    let envelope = Envelope { checksum, body };
    info!(records = count, "exported snapshot");
    serde_json::to_string(&envelope).map_err(|e| LatticeError::Snapshot(e.to_string()))
}

/// Rebuild an engine from a snapshot. The catalog must declare the same
/// models and fields the snapshot was taken under; computations are
/// attached to the catalog as usual and re-run on first read.
pub fn import(catalog: Catalog, settings: Settings, data: &str) -> Result<Engine> {
    let envelope: Envelope =
        serde_json::from_str(data).map_err(|e| LatticeError::Snapshot(e.to_string()))?;
    if envelope.body.version != FORMAT_VERSION {
        return Err(LatticeError::Snapshot(format!(
            "unsupported snapshot version {}",
            envelope.body.version
        )));
    }
    let verify = settings.verify_snapshot_checksum;
    if verify {
        let payload = serde_json::to_string(&envelope.body)
            .map_err(|e| LatticeError::Snapshot(e.to_string()))?;
        let checksum = blake3::hash(payload.as_bytes()).to_hex().to_string();
        if checksum != envelope.checksum {
            return Err(LatticeError::Snapshot("checksum mismatch".to_owned()));
        }
    }

    let engine = Engine::with_settings(catalog, settings)?;
    {
        let mut core = engine.lock()?;
        let schema = std::sync::Arc::clone(&core.schema);

        // First pass: adopt every record with its slots filled in.
        for snap in &envelope.body.records {
            let model = schema
                .model_id(&snap.model)
                .map_err(|e| LatticeError::Snapshot(e.to_string()))?;
            let ms = schema.model(model);
            if core.records.contains_key(&snap.handle) {
                return Err(LatticeError::Snapshot(format!(
                    "handle {} appears twice",
                    snap.handle
                )));
            }
            let mut slots: Vec<Slot> = ms
                .fields()
                .map(|(_, meta)| match meta.wiring() {
                    FieldWiring::Attribute(_) => Slot::Attr(None),
                    FieldWiring::One { .. } => Slot::One(None),
                    FieldWiring::Many { .. } => Slot::Many(Vec::new()),
                })
                .collect();
            for (name, value) in &snap.attrs {
                let fid = ms
                    .field_id(name)
                    .map_err(|e| LatticeError::Snapshot(e.to_string()))?;
                let kind = match ms.field(fid).wiring() {
                    FieldWiring::Attribute(kind) => kind,
                    _ => {
                        return Err(LatticeError::Snapshot(format!(
                            "'{}.{}' is not an attribute",
                            snap.model, name
                        )));
                    }
                };
                if !value.fits(kind) {
                    return Err(LatticeError::Snapshot(format!(
                        "value for '{}.{}' does not fit kind {}",
                        snap.model, name, kind
                    )));
                }
                slots[fid as usize] = Slot::Attr(Some(value.clone()));
            }
            for (name, target) in &snap.ones {
                let fid = ms
                    .field_id(name)
                    .map_err(|e| LatticeError::Snapshot(e.to_string()))?;
                if !matches!(ms.field(fid).wiring(), FieldWiring::One { .. }) {
                    return Err(LatticeError::Snapshot(format!(
                        "'{}.{}' is not a single relation",
                        snap.model, name
                    )));
                }
                slots[fid as usize] = Slot::One(Some(*target));
            }
            for (name, targets) in &snap.manys {
                let fid = ms
                    .field_id(name)
                    .map_err(|e| LatticeError::Snapshot(e.to_string()))?;
                if !matches!(ms.field(fid).wiring(), FieldWiring::Many { .. }) {
                    return Err(LatticeError::Snapshot(format!(
                        "'{}.{}' is not a multi relation",
                        snap.model, name
                    )));
                }
                slots[fid as usize] = Slot::Many(targets.clone());
            }
            core.adopt(snap.handle, model, slots);
        }

        // Second pass: every edge must point at an adopted record of the
        // right model, and where an inverse is declared the mirror must be
        // present; the snapshot carries both sides.
        for (model_id, ms) in schema.models() {
            let handles: Vec<Handle> = core.live[model_id as usize].iter().collect();
            for handle in handles {
                for (fid, meta) in ms.fields() {
                    let (target_model, inverse) = match meta.wiring() {
                        FieldWiring::One { target, inverse }
                        | FieldWiring::Many { target, inverse } => (target, inverse),
                        FieldWiring::Attribute(_) => continue,
                    };
                    for target in core.forward_targets(handle, fid)? {
                        let other = core.records.get(&target).ok_or_else(|| {
                            LatticeError::Snapshot(format!(
                                "'{}.{}' of record {} points at missing record {}",
                                ms.name(),
                                meta.name(),
                                handle,
                                target
                            ))
                        })?;
                        if other.model != target_model {
                            return Err(LatticeError::Snapshot(format!(
                                "'{}.{}' of record {} points at a record of the wrong model",
                                ms.name(),
                                meta.name(),
                                handle
                            )));
                        }
                        if let Some(g) = inverse {
                            if !core.forward_contains(target, g, handle)? {
                                return Err(LatticeError::Snapshot(format!(
                                    "inverse of '{}.{}' missing on record {}",
                                    ms.name(),
                                    meta.name(),
                                    target
                                )));
                            }
                        }
                    }
                }
            }
        }

        // Third pass: rebuild the identity maps from the identifying slots.
        for (model_id, ms) in schema.models() {
            if !ms.is_singleton() {
                continue;
            }
            let handles: Vec<Handle> = core.live[model_id as usize].iter().collect();
            for handle in handles {
                let mut parts = Vec::with_capacity(ms.identifying().len());
                for fid in ms.identifying() {
                    let record = core
                        .records
                        .get(&handle)
                        .ok_or_else(|| LatticeError::Invariant("live set out of sync".to_owned()))?;
                    let part = match &record.slots[*fid as usize] {
                        Slot::Attr(Some(value)) => KeyPart::Value(value.clone()),
                        Slot::One(Some(target)) => KeyPart::Record(*target),
                        _ => {
                            return Err(LatticeError::Snapshot(format!(
                                "record {} of '{}' is missing its identifying value for '{}'",
                                handle,
                                ms.name(),
                                ms.field(*fid).name()
                            )));
                        }
                    };
                    parts.push(part);
                }
                if !core.remember_identity(model_id, IdentityKey::new(parts), handle) {
                    return Err(LatticeError::Snapshot(format!(
                        "records of '{}' share an identity",
                        ms.name()
                    )));
                }
            }
        }
    }
    info!(records = engine.record_count()?, "imported snapshot");
    Ok(engine)
}
