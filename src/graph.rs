use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex, MutexGuard};

// used to keep the two-way mapping between identity keys and record handles
use bimap::BiMap;
// liveness and graveyard sets over dense handle spaces
use roaring::RoaringTreemap;
use seahash::SeaHasher;
use tracing::{debug, info, warn};

use crate::error::{LatticeError, Result};
use crate::reactive::{BeginFault, Tracker, pack};
use crate::schema::{Catalog, Derived, FieldId, FieldWiring, ModelId, Schema};
use crate::settings::Settings;
use crate::value::Value;

// ------------- Handle -------------
/// An opaque record handle. Handles are allocated sequentially and are
/// never reissued after destruction.
pub type Handle = u64;

pub type HandleHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub const GENESIS: Handle = 0;

#[derive(Debug)]
struct HandleGenerator {
    lower_bound: Handle,
}

impl HandleGenerator {
    fn new() -> Self {
        Self { lower_bound: GENESIS }
    }
    fn generate(&mut self) -> Handle {
        self.lower_bound += 1;
        self.lower_bound
    }
    // Handles arriving from the outside (snapshot restore) push the lower
    // bound so freshly generated ones never collide.
    fn retain(&mut self, handle: Handle) {
        if handle > self.lower_bound {
            self.lower_bound = handle;
        }
    }
}

// ------------- Identity -------------
/// One component of an identity tuple.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum KeyPart {
    Value(Value),
    Record(Handle),
}

/// The canonicalized identifying tuple of a record, in the model's declared
/// identifying-field order.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct IdentityKey(Vec<KeyPart>);

impl IdentityKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }
}

/// Owns the identity maps: for every model with identifying fields, at most
/// one live record per key. The map is bidirectional so destruction can
/// drop a record's entry without recomputing its key.
#[derive(Debug, Default)]
struct IdentityKeeper {
    kept: HashMap<ModelId, BiMap<IdentityKey, Handle>, OtherHasher>,
}

impl IdentityKeeper {
    fn resolve(&self, model: ModelId, key: &IdentityKey) -> Option<Handle> {
        self.kept.get(&model).and_then(|map| map.get_by_left(key).copied())
    }
    fn keep(&mut self, model: ModelId, key: IdentityKey, handle: Handle) {
        self.kept.entry(model).or_default().insert(key, handle);
    }
    fn release(&mut self, model: ModelId, handle: Handle) -> bool {
        self.kept
            .get_mut(&model)
            .map(|map| map.remove_by_right(&handle).is_some())
            .unwrap_or(false)
    }
}

// ------------- Seeds -------------
/// An initial value handed to [`Engine::get_or_create`]: either an
/// attribute value or the handle of a related record.
#[derive(Debug, Clone)]
pub enum Seed {
    Value(Value),
    Record(Handle),
}

impl Seed {
    pub fn record(handle: Handle) -> Seed {
        Seed::Record(handle)
    }
    pub fn value(value: Value) -> Seed {
        Seed::Value(value)
    }
}
impl From<Value> for Seed {
    fn from(v: Value) -> Seed {
        Seed::Value(v)
    }
}
impl From<i64> for Seed {
    fn from(i: i64) -> Seed {
        Seed::Value(Value::Integer(i))
    }
}
impl From<&str> for Seed {
    fn from(s: &str) -> Seed {
        Seed::Value(Value::Text(s.to_owned()))
    }
}
impl From<bool> for Seed {
    fn from(b: bool) -> Seed {
        Seed::Value(Value::Boolean(b))
    }
}

// ------------- Records -------------
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Attr(Option<Value>),
    One(Option<Handle>),
    Many(Vec<Handle>),
}

#[derive(Debug)]
pub(crate) struct Record {
    pub(crate) model: ModelId,
    pub(crate) slots: Vec<Slot>,
}

// ------------- Commands -------------
/// A relation mutation intent, interpreted uniformly by [`Engine::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationCommand {
    /// Unlink every current target.
    Clear,
    /// Add a link to the given record.
    Link(Handle),
    /// Remove the link to the given record, if present.
    Unlink(Handle),
    /// Make the given record the sole target.
    Replace(Handle),
}

// ------------- Core -------------
pub(crate) struct Core {
    pub(crate) schema: Arc<Schema>,
    pub(crate) settings: Settings,
    generator: HandleGenerator,
    pub(crate) records: HashMap<Handle, Record, HandleHasher>,
    pub(crate) live: Vec<RoaringTreemap>,
    graveyard: RoaringTreemap,
    identities: IdentityKeeper,
    tracker: Tracker,
}

impl Core {
    fn record(&self, handle: Handle) -> Result<&Record> {
        match self.records.get(&handle) {
            Some(record) => Ok(record),
            None if self.graveyard.contains(handle) => {
                Err(LatticeError::UseAfterDestroy(handle))
            }
            None => Err(LatticeError::UnknownRecord(handle)),
        }
    }

    fn resolve(&self, handle: Handle, field: &str) -> Result<(ModelId, FieldId)> {
        let model = self.record(handle)?.model;
        let fid = self.schema.model(model).field_id(field)?;
        Ok((model, fid))
    }

    fn field_label(&self, model: ModelId, field: FieldId) -> String {
        let ms = self.schema.model(model);
        format!("{}.{}", ms.name(), ms.field(field).name())
    }

    // ---- slot access ----
    fn slot(&self, handle: Handle, field: FieldId) -> Result<&Slot> {
        let record = self.record(handle)?;
        record
            .slots
            .get(field as usize)
            .ok_or_else(|| LatticeError::Invariant(format!("missing slot {} on {}", field, handle)))
    }

    fn slot_mut(&mut self, handle: Handle, field: FieldId) -> Result<&mut Slot> {
        let record = self
            .records
            .get_mut(&handle)
            .ok_or(LatticeError::UnknownRecord(handle))?;
        record
            .slots
            .get_mut(field as usize)
            .ok_or_else(|| LatticeError::Invariant(format!("missing slot {} on {}", field, handle)))
    }

    fn one_slot(&self, handle: Handle, field: FieldId) -> Result<Option<Handle>> {
        match self.slot(handle, field)? {
            Slot::One(target) => Ok(*target),
            _ => Err(LatticeError::Invariant(format!(
                "slot {} on {} is not a single relation",
                field, handle
            ))),
        }
    }

    pub(crate) fn forward_targets(&self, handle: Handle, field: FieldId) -> Result<Vec<Handle>> {
        match self.slot(handle, field)? {
            Slot::One(target) => Ok(target.iter().copied().collect()),
            Slot::Many(targets) => Ok(targets.clone()),
            Slot::Attr(_) => Err(LatticeError::Invariant(format!(
                "slot {} on {} is not a relation",
                field, handle
            ))),
        }
    }

    pub(crate) fn forward_contains(&self, handle: Handle, field: FieldId, target: Handle) -> Result<bool> {
        match self.slot(handle, field)? {
            Slot::One(current) => Ok(*current == Some(target)),
            Slot::Many(targets) => Ok(targets.contains(&target)),
            Slot::Attr(_) => Err(LatticeError::Invariant(format!(
                "slot {} on {} is not a relation",
                field, handle
            ))),
        }
    }

    fn insert_forward(&mut self, handle: Handle, field: FieldId, target: Handle) -> Result<()> {
        match self.slot_mut(handle, field)? {
            Slot::One(slot) => {
                if slot.is_some() && *slot != Some(target) {
                    return Err(LatticeError::Invariant(format!(
                        "single slot {} on {} still occupied",
                        field, handle
                    )));
                }
                *slot = Some(target);
            }
            Slot::Many(targets) => {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            Slot::Attr(_) => {
                return Err(LatticeError::Invariant(format!(
                    "slot {} on {} is not a relation",
                    field, handle
                )));
            }
        }
        Ok(())
    }

    fn remove_forward(&mut self, handle: Handle, field: FieldId, target: Handle) -> Result<()> {
        match self.slot_mut(handle, field)? {
            Slot::One(slot) => {
                if *slot == Some(target) {
                    *slot = None;
                }
            }
            Slot::Many(targets) => {
                targets.retain(|t| *t != target);
            }
            Slot::Attr(_) => {
                return Err(LatticeError::Invariant(format!(
                    "slot {} on {} is not a relation",
                    field, handle
                )));
            }
        }
        Ok(())
    }

    fn invalidate_field(&mut self, handle: Handle, field: FieldId) {
        self.tracker.invalidate(pack(handle, field));
    }

    // ---- construction ----
    fn allocate(&mut self, model: ModelId) -> Handle {
        let handle = self.generator.generate();
        let schema = Arc::clone(&self.schema);
        let ms = schema.model(model);
        let slots = ms
            .fields()
            .map(|(_, meta)| match meta.wiring() {
                FieldWiring::Attribute(_) => Slot::Attr(None),
                FieldWiring::One { .. } => Slot::One(None),
                FieldWiring::Many { .. } => Slot::Many(Vec::new()),
            })
            .collect();
        self.records.insert(handle, Record { model, slots });
        self.live[model as usize].insert(handle);
        // computed fields start dirty so the first read evaluates them
        for (fid, meta) in ms.fields() {
            if meta.is_computed() {
                self.tracker.mark_dirty(pack(handle, fid));
            }
        }
        debug!(handle, model = %ms.name(), "allocated record");
        handle
    }

    fn create(&mut self, model_name: &str) -> Result<Handle> {
        let model = self.schema.model_id(model_name)?;
        if self.schema.model(model).is_singleton() {
            return Err(LatticeError::Schema(format!(
                "model '{}' declares identifying fields; use get_or_create",
                model_name
            )));
        }
        Ok(self.allocate(model))
    }

    fn get_or_create(&mut self, model_name: &str, seeds: &[(&str, Seed)]) -> Result<Handle> {
        let schema = Arc::clone(&self.schema);
        let model = schema.model_id(model_name)?;
        let ms = schema.model(model);

        // Validate everything up front so construction cannot fail half-way.
        let mut resolved: Vec<(FieldId, &Seed)> = Vec::with_capacity(seeds.len());
        for (name, seed) in seeds {
            let fid = ms.field_id(name)?;
            let meta = ms.field(fid);
            if meta.is_computed() {
                return Err(LatticeError::Schema(format!(
                    "computed field '{}.{}' cannot be seeded",
                    model_name, name
                )));
            }
            match (meta.wiring(), seed) {
                (FieldWiring::Attribute(kind), Seed::Value(value)) => {
                    if !value.fits(kind) {
                        return Err(LatticeError::ValueMismatch {
                            field: format!("{}.{}", model_name, name),
                            expected: kind.to_string(),
                            got: value.kind().to_string(),
                        });
                    }
                }
                (FieldWiring::Attribute(kind), Seed::Record(_)) => {
                    return Err(LatticeError::ValueMismatch {
                        field: format!("{}.{}", model_name, name),
                        expected: kind.to_string(),
                        got: "record".to_owned(),
                    });
                }
                (FieldWiring::One { target, .. }, Seed::Record(handle)) => {
                    let other = self.record(*handle)?;
                    if other.model != target {
                        return Err(LatticeError::ValueMismatch {
                            field: format!("{}.{}", model_name, name),
                            expected: schema.model(target).name().to_owned(),
                            got: schema.model(other.model).name().to_owned(),
                        });
                    }
                }
                (FieldWiring::One { target, .. }, Seed::Value(_)) => {
                    return Err(LatticeError::ValueMismatch {
                        field: format!("{}.{}", model_name, name),
                        expected: format!("{} record", schema.model(target).name()),
                        got: "value".to_owned(),
                    });
                }
                (FieldWiring::Many { .. }, _) => {
                    return Err(LatticeError::Schema(format!(
                        "multi relation '{}.{}' cannot be seeded",
                        model_name, name
                    )));
                }
            }
            resolved.push((fid, seed));
        }

        let handle = if ms.is_singleton() {
            let mut parts = Vec::with_capacity(ms.identifying().len());
            for fid in ms.identifying() {
                let seed = resolved
                    .iter()
                    .find(|(f, _)| f == fid)
                    .map(|(_, s)| *s)
                    .ok_or_else(|| {
                        LatticeError::Schema(format!(
                            "missing identifying value for '{}.{}'",
                            model_name,
                            ms.field(*fid).name()
                        ))
                    })?;
                parts.push(match seed {
                    Seed::Value(value) => KeyPart::Value(value.clone()),
                    Seed::Record(handle) => KeyPart::Record(*handle),
                });
            }
            let key = IdentityKey(parts);
            if let Some(existing) = self.identities.resolve(model, &key) {
                debug!(handle = existing, model = model_name, "identity hit");
                return Ok(existing);
            }
            let handle = self.allocate(model);
            self.identities.keep(model, key, handle);
            handle
        } else {
            self.allocate(model)
        };

        for (fid, seed) in resolved {
            match seed {
                Seed::Value(value) => {
                    *self.slot_mut(handle, fid)? = Slot::Attr(Some(value.clone()));
                }
                Seed::Record(target) => {
                    self.attach(handle, fid, *target)?;
                }
            }
        }
        Ok(handle)
    }

    // ---- the single-edge primitive ----
    //
    // attach/detach update one edge and its mirror directly on the slots,
    // never re-entering through the public mutation surface, so cyclic and
    // self-referential graphs cannot recurse.
    fn attach(&mut self, a: Handle, f: FieldId, b: Handle) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let am = self.record(a)?.model;
        let meta = schema.model(am).field(f);
        let (target, inverse, single) = match meta.wiring() {
            FieldWiring::One { target, inverse } => (target, inverse, true),
            FieldWiring::Many { target, inverse } => (target, inverse, false),
            FieldWiring::Attribute(_) => {
                return Err(LatticeError::IllegalMutation(format!(
                    "field '{}' is an attribute, not a relation",
                    self.field_label(am, f)
                )));
            }
        };
        let bm = self.record(b)?.model;
        if bm != target {
            return Err(LatticeError::InverseMaintenance(format!(
                "cannot link '{}' to a '{}' record; target model is '{}'",
                self.field_label(am, f),
                schema.model(bm).name(),
                schema.model(target).name()
            )));
        }
        if self.forward_contains(a, f, b)? {
            return Ok(());
        }

        // Occupied single slots displace their current occupant; the
        // displaced edge is retracted on both sides before the new one
        // goes in.
        let mut removals: Vec<(Handle, FieldId, Handle)> = Vec::new();
        if single {
            if let Some(old) = self.one_slot(a, f)? {
                removals.push((a, f, old));
            }
        }
        if let Some(g) = inverse {
            if matches!(schema.model(target).field(g).wiring(), FieldWiring::One { .. }) {
                if let Some(other) = self.one_slot(b, g)? {
                    if other != a {
                        removals.push((b, g, other));
                    }
                }
            }
        }
        for (x, xf, y) in removals {
            self.remove_edge(x, xf, y)?;
        }

        self.insert_forward(a, f, b)?;
        self.invalidate_field(a, f);
        if let Some(g) = inverse {
            self.insert_forward(b, g, a)?;
            self.invalidate_field(b, g);
        }
        debug!(from = a, to = b, field = %self.field_label(am, f), "linked");
        Ok(())
    }

    /// Remove the edge `x.f -> y` together with its mirror.
    fn remove_edge(&mut self, x: Handle, f: FieldId, y: Handle) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let xm = self.record(x)?.model;
        let inverse = schema.model(xm).field(f).wiring().inverse();
        self.remove_forward(x, f, y)?;
        self.invalidate_field(x, f);
        if let Some(g) = inverse {
            self.remove_forward(y, g, x)?;
            self.invalidate_field(y, g);
        }
        Ok(())
    }

    fn detach(&mut self, a: Handle, f: FieldId, b: Handle) -> Result<()> {
        let am = self.record(a)?.model;
        self.record(b)?;
        if !self.schema.model(am).field(f).wiring().is_relation() {
            return Err(LatticeError::IllegalMutation(format!(
                "field '{}' is an attribute, not a relation",
                self.field_label(am, f)
            )));
        }
        if !self.forward_contains(a, f, b)? {
            debug!(from = a, to = b, "unlink of absent edge ignored");
            return Ok(());
        }
        self.remove_edge(a, f, b)?;
        debug!(from = a, to = b, field = %self.field_label(am, f), "unlinked");
        Ok(())
    }

    fn apply(&mut self, handle: Handle, field: &str, command: MutationCommand) -> Result<()> {
        let (model, fid) = self.resolve(handle, field)?;
        let schema = Arc::clone(&self.schema);
        let ms = schema.model(model);
        let meta = ms.field(fid);
        if !meta.wiring().is_relation() {
            return Err(LatticeError::IllegalMutation(format!(
                "field '{}' is an attribute; use write()",
                self.field_label(model, fid)
            )));
        }
        if ms.is_identifying(fid) {
            return Err(LatticeError::IllegalMutation(format!(
                "identifying field '{}' is frozen after construction",
                self.field_label(model, fid)
            )));
        }
        if meta.readonly() {
            if self.settings.strict_readonly {
                return Err(LatticeError::IllegalMutation(format!(
                    "field '{}' is read-only",
                    self.field_label(model, fid)
                )));
            }
            warn!(field = %self.field_label(model, fid), "mutating read-only field");
        }
        match command {
            MutationCommand::Link(target) => self.attach(handle, fid, target),
            MutationCommand::Unlink(target) => self.detach(handle, fid, target),
            MutationCommand::Replace(target) => {
                for current in self.forward_targets(handle, fid)? {
                    if current != target {
                        self.remove_edge(handle, fid, current)?;
                    }
                }
                self.attach(handle, fid, target)
            }
            MutationCommand::Clear => {
                for current in self.forward_targets(handle, fid)? {
                    self.remove_edge(handle, fid, current)?;
                }
                Ok(())
            }
        }
    }

    // ---- attributes ----
    fn attr_value(&self, handle: Handle, model: ModelId, field: FieldId) -> Result<Value> {
        let meta = self.schema.model(model).field(field);
        match self.slot(handle, field)? {
            Slot::Attr(Some(value)) => Ok(value.clone()),
            Slot::Attr(None) => Ok(meta.default().cloned().unwrap_or(Value::Void)),
            _ => Err(LatticeError::Invariant(format!(
                "slot {} on {} is not an attribute",
                field, handle
            ))),
        }
    }

    fn read(&mut self, handle: Handle, field: &str) -> Result<Value> {
        let (model, fid) = self.resolve(handle, field)?;
        if self.schema.model(model).field(fid).wiring().is_relation() {
            return Err(LatticeError::Schema(format!(
                "field '{}' is a relation; use target()/targets()",
                self.field_label(model, fid)
            )));
        }
        self.settle(handle, model, fid)?;
        self.attr_value(handle, model, fid)
    }

    fn write(&mut self, handle: Handle, field: &str, value: Value) -> Result<()> {
        let (model, fid) = self.resolve(handle, field)?;
        let schema = Arc::clone(&self.schema);
        let ms = schema.model(model);
        let meta = ms.field(fid);
        let kind = match meta.wiring() {
            FieldWiring::Attribute(kind) => kind,
            _ => {
                return Err(LatticeError::IllegalMutation(format!(
                    "relation field '{}' must be mutated through link/unlink/replace/clear",
                    self.field_label(model, fid)
                )));
            }
        };
        if ms.is_identifying(fid) {
            return Err(LatticeError::IllegalMutation(format!(
                "identifying field '{}' is frozen after construction",
                self.field_label(model, fid)
            )));
        }
        if meta.readonly() {
            if self.settings.strict_readonly {
                return Err(LatticeError::IllegalMutation(format!(
                    "field '{}' is read-only",
                    self.field_label(model, fid)
                )));
            }
            warn!(field = %self.field_label(model, fid), "writing read-only field");
        }
        if !value.fits(kind) {
            return Err(LatticeError::ValueMismatch {
                field: self.field_label(model, fid),
                expected: kind.to_string(),
                got: value.kind().to_string(),
            });
        }
        let next = if value.is_void() { None } else { Some(value) };
        let key = pack(handle, fid);
        {
            let slot = self.slot_mut(handle, fid)?;
            if matches!(slot, Slot::Attr(current) if *current == next) {
                return Ok(());
            }
            *slot = Slot::Attr(next);
        }
        // A direct write makes the stored value current by fiat.
        self.tracker.clean(key);
        self.tracker.invalidate(key);
        debug!(handle, field = %self.field_label(model, fid), "wrote attribute");
        Ok(())
    }

    // ---- relations, read side ----
    fn target(&mut self, handle: Handle, field: &str) -> Result<Option<Handle>> {
        let (model, fid) = self.resolve(handle, field)?;
        match self.schema.model(model).field(fid).wiring() {
            FieldWiring::One { .. } => {
                self.settle(handle, model, fid)?;
                self.one_slot(handle, fid)
            }
            FieldWiring::Many { .. } => Err(LatticeError::Schema(format!(
                "field '{}' is a multi relation; use targets()",
                self.field_label(model, fid)
            ))),
            FieldWiring::Attribute(_) => Err(LatticeError::Schema(format!(
                "field '{}' is an attribute; use read()",
                self.field_label(model, fid)
            ))),
        }
    }

    fn targets(&mut self, handle: Handle, field: &str) -> Result<Vec<Handle>> {
        let (model, fid) = self.resolve(handle, field)?;
        if !self.schema.model(model).field(fid).wiring().is_relation() {
            return Err(LatticeError::Schema(format!(
                "field '{}' is an attribute; use read()",
                self.field_label(model, fid)
            )));
        }
        self.settle(handle, model, fid)?;
        self.forward_targets(handle, fid)
    }

    // ---- computation ----
    fn settle(&mut self, handle: Handle, model: ModelId, field: FieldId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let Some(compute) = schema.model(model).field(field).compute() else {
            return Ok(());
        };
        let key = pack(handle, field);
        if !self.tracker.is_dirty(key) {
            return Ok(());
        }
        let label = self.field_label(model, field);
        let depth_cap = self.settings.max_compute_depth;
        self.tracker.begin(key, depth_cap).map_err(|fault| LatticeError::Computation {
            field: label.clone(),
            message: match fault {
                BeginFault::Cycle => "dependency cycle".to_owned(),
                BeginFault::Depth => "computation nesting too deep".to_owned(),
            },
        })?;
        self.tracker.retract(key);
        let fun = Arc::clone(compute);
        let outcome = {
            let mut scope = Scope { core: &mut *self, owner: handle, consumer: key };
            fun(&mut scope)
        };
        self.tracker.finish(key);
        // Clean either way: on failure the previously cached value stands
        // until one of the sources read so far changes again.
        self.tracker.clean(key);
        match outcome {
            Ok(derived) => {
                self.store_derived(handle, model, field, derived).map_err(|e| match e {
                    LatticeError::Computation { .. } => e,
                    other => LatticeError::Computation {
                        field: label.clone(),
                        message: other.to_string(),
                    },
                })
            }
            Err(e) => {
                warn!(field = %label, error = %e, "computation failed; keeping cached value");
                Err(LatticeError::Computation { field: label, message: e.to_string() })
            }
        }
    }

    fn store_derived(
        &mut self,
        handle: Handle,
        model: ModelId,
        field: FieldId,
        derived: Derived,
    ) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let meta = schema.model(model).field(field);
        let key = pack(handle, field);
        match (meta.wiring(), derived) {
            (FieldWiring::Attribute(kind), Derived::Value(value)) => {
                if !value.fits(kind) {
                    return Err(LatticeError::Computation {
                        field: self.field_label(model, field),
                        message: format!(
                            "computed value of kind {} does not fit declared kind {}",
                            value.kind(),
                            kind
                        ),
                    });
                }
                let next = Some(value);
                let slot = self.slot_mut(handle, field)?;
                if !matches!(slot, Slot::Attr(current) if *current == next) {
                    *slot = Slot::Attr(next);
                    self.tracker.invalidate(key);
                }
                Ok(())
            }
            (FieldWiring::Attribute(_), Derived::Clear) => {
                let slot = self.slot_mut(handle, field)?;
                if !matches!(slot, Slot::Attr(None)) {
                    *slot = Slot::Attr(None);
                    self.tracker.invalidate(key);
                }
                Ok(())
            }
            (FieldWiring::One { .. }, Derived::Target(target)) => {
                self.store_computed_targets(handle, field, vec![target])
            }
            (FieldWiring::One { .. }, Derived::Clear) => {
                self.store_computed_targets(handle, field, Vec::new())
            }
            (FieldWiring::Many { .. }, Derived::Targets(targets)) => {
                self.store_computed_targets(handle, field, targets)
            }
            (FieldWiring::Many { .. }, Derived::Clear) => {
                self.store_computed_targets(handle, field, Vec::new())
            }
            (_, _) => Err(LatticeError::Computation {
                field: self.field_label(model, field),
                message: "computed outcome does not fit the field's kind".to_owned(),
            }),
        }
    }

    fn store_computed_targets(
        &mut self,
        handle: Handle,
        field: FieldId,
        desired: Vec<Handle>,
    ) -> Result<()> {
        // Validate first so the relation edit cannot stop half-way.
        for target in &desired {
            self.record(*target)?;
        }
        let current = self.forward_targets(handle, field)?;
        for old in &current {
            if !desired.contains(old) {
                self.remove_edge(handle, field, *old)?;
            }
        }
        for new in desired {
            if !current.contains(&new) {
                self.attach(handle, field, new)?;
            }
        }
        Ok(())
    }

    // ---- snapshot restore ----
    /// Insert a record under an externally supplied handle, as the snapshot
    /// restore path does. The generator retains the handle so future
    /// allocations never collide.
    pub(crate) fn adopt(&mut self, handle: Handle, model: ModelId, slots: Vec<Slot>) {
        self.generator.retain(handle);
        let schema = Arc::clone(&self.schema);
        for (fid, meta) in schema.model(model).fields() {
            if meta.is_computed() {
                self.tracker.mark_dirty(pack(handle, fid));
            }
        }
        self.records.insert(handle, Record { model, slots });
        self.live[model as usize].insert(handle);
    }

    /// Re-register an identity entry for an adopted record. Returns false
    /// when the key was already taken by another record.
    pub(crate) fn remember_identity(
        &mut self,
        model: ModelId,
        key: IdentityKey,
        handle: Handle,
    ) -> bool {
        if self.identities.resolve(model, &key).is_some() {
            return false;
        }
        self.identities.keep(model, key, handle);
        true
    }

    // ---- destruction ----
    fn destroy(&mut self, handle: Handle) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let model = self.record(handle)?.model;
        let ms = schema.model(model);

        // Retract every edge this record holds, mirrors included. When the
        // mirror is the identifying field of the counterpart, that record's
        // identity entry no longer matches anything and is dropped.
        for (fid, meta) in ms.fields() {
            let (target_model, inverse) = match meta.wiring() {
                FieldWiring::One { target, inverse } | FieldWiring::Many { target, inverse } => {
                    (target, inverse)
                }
                FieldWiring::Attribute(_) => continue,
            };
            for target in self.forward_targets(handle, fid)? {
                self.remove_edge(handle, fid, target)?;
                if let Some(g) = inverse {
                    if schema.model(target_model).is_identifying(g)
                        && self.identities.release(target_model, target)
                    {
                        warn!(
                            record = target,
                            "identity released; identifying relation retracted by destruction"
                        );
                    }
                }
            }
        }

        // Relations declared without an inverse leave no trace on this
        // record; sweep the models that hold such fields.
        for (om, other) in schema.models() {
            for (ofid, ometa) in other.fields() {
                let points_here = ometa.wiring().is_relation()
                    && ometa.wiring().target() == Some(model)
                    && ometa.wiring().inverse().is_none();
                if !points_here {
                    continue;
                }
                let holders: Vec<Handle> = self.live[om as usize].iter().collect();
                for holder in holders {
                    if holder != handle && self.forward_contains(holder, ofid, handle)? {
                        self.remove_forward(holder, ofid, handle)?;
                        self.invalidate_field(holder, ofid);
                    }
                }
            }
        }

        self.identities.release(model, handle);
        // Dependents of this record's fields must notice, even though their
        // next computation will likely fail and fall back.
        for (fid, _) in ms.fields() {
            self.invalidate_field(handle, fid);
        }
        self.tracker.forget_record(handle, ms.field_count());
        self.records.remove(&handle);
        self.live[model as usize].remove(handle);
        self.graveyard.insert(handle);
        info!(handle, model = %ms.name(), "destroyed record");
        Ok(())
    }
}

// ------------- Scope -------------
/// The window a computed field's function sees the graph through. Every
/// read is recorded as a dependency of the computing field.
pub struct Scope<'a> {
    core: &'a mut Core,
    owner: Handle,
    consumer: u64,
}

impl Scope<'_> {
    /// The record the computed field lives on.
    pub fn owner(&self) -> Handle {
        self.owner
    }

    /// Read an attribute, settling it first if it is itself computed.
    pub fn get(&mut self, record: Handle, field: &str) -> Result<Value> {
        let (model, fid) = self.core.resolve(record, field)?;
        self.core.tracker.note(self.consumer, pack(record, fid));
        if self.core.schema.model(model).field(fid).wiring().is_relation() {
            return Err(LatticeError::Schema(format!(
                "field '{}' is a relation; use first()/all()",
                self.core.field_label(model, fid)
            )));
        }
        self.core.settle(record, model, fid)?;
        self.core.attr_value(record, model, fid)
    }

    /// Read a single relation's target.
    pub fn first(&mut self, record: Handle, field: &str) -> Result<Option<Handle>> {
        let (model, fid) = self.core.resolve(record, field)?;
        self.core.tracker.note(self.consumer, pack(record, fid));
        match self.core.schema.model(model).field(fid).wiring() {
            FieldWiring::One { .. } => {
                self.core.settle(record, model, fid)?;
                self.core.one_slot(record, fid)
            }
            _ => Err(LatticeError::Schema(format!(
                "field '{}' is not a single relation",
                self.core.field_label(model, fid)
            ))),
        }
    }

    /// Read a relation's full target list.
    pub fn all(&mut self, record: Handle, field: &str) -> Result<Vec<Handle>> {
        let (model, fid) = self.core.resolve(record, field)?;
        self.core.tracker.note(self.consumer, pack(record, fid));
        if !self.core.schema.model(model).field(fid).wiring().is_relation() {
            return Err(LatticeError::Schema(format!(
                "field '{}' is an attribute; use get()",
                self.core.field_label(model, fid)
            )));
        }
        self.core.settle(record, model, fid)?;
        self.core.forward_targets(record, fid)
    }
}

// ------------- Engine -------------
/// A record graph: one sealed schema plus the records, identities, relation
/// edges, and computation bookkeeping that live under it. Engines are
/// independent of each other; tests and hosts may run as many as they like.
pub struct Engine {
    core: Mutex<Core>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(catalog: Catalog) -> Result<Engine> {
        Self::with_settings(catalog, Settings::default())
    }

    pub fn with_settings(catalog: Catalog, settings: Settings) -> Result<Engine> {
        let schema = Arc::new(catalog.seal()?);
        let live = (0..schema.model_count()).map(|_| RoaringTreemap::new()).collect();
        Ok(Engine {
            core: Mutex::new(Core {
                schema,
                settings,
                generator: HandleGenerator::new(),
                records: HashMap::default(),
                live,
                graveyard: RoaringTreemap::new(),
                identities: IdentityKeeper::default(),
                tracker: Tracker::new(),
            }),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Core>> {
        self.core.lock().map_err(|e| LatticeError::Lock(e.to_string()))
    }

    /// Allocate a record of a model without identifying fields.
    pub fn create(&self, model: &str) -> Result<Handle> {
        self.lock()?.create(model)
    }

    /// Return the record with this identity, creating it first if needed.
    /// Lookup and insertion happen under one lock, so concurrent callers
    /// with the same key observe the same record.
    pub fn get_or_create(&self, model: &str, seeds: &[(&str, Seed)]) -> Result<Handle> {
        self.lock()?.get_or_create(model, seeds)
    }

    /// Read an attribute, recomputing it first when it is stale.
    pub fn read(&self, record: Handle, field: &str) -> Result<Value> {
        self.lock()?.read(record, field)
    }

    /// Write an attribute.
    pub fn write(&self, record: Handle, field: &str, value: Value) -> Result<()> {
        self.lock()?.write(record, field, value)
    }

    /// Current target of a single relation.
    pub fn target(&self, record: Handle, field: &str) -> Result<Option<Handle>> {
        self.lock()?.target(record, field)
    }

    /// Current targets of a relation.
    pub fn targets(&self, record: Handle, field: &str) -> Result<Vec<Handle>> {
        self.lock()?.targets(record, field)
    }

    /// Interpret a [`MutationCommand`] against a relation field.
    pub fn apply(&self, record: Handle, field: &str, command: MutationCommand) -> Result<()> {
        self.lock()?.apply(record, field, command)
    }

    pub fn link(&self, record: Handle, field: &str, target: Handle) -> Result<()> {
        self.apply(record, field, MutationCommand::Link(target))
    }

    pub fn unlink(&self, record: Handle, field: &str, target: Handle) -> Result<()> {
        self.apply(record, field, MutationCommand::Unlink(target))
    }

    pub fn replace(&self, record: Handle, field: &str, target: Handle) -> Result<()> {
        self.apply(record, field, MutationCommand::Replace(target))
    }

    pub fn clear_relation(&self, record: Handle, field: &str) -> Result<()> {
        self.apply(record, field, MutationCommand::Clear)
    }

    /// Destroy a record: every edge it participates in is retracted first,
    /// then its identity entry is dropped and the handle goes dead.
    pub fn destroy(&self, record: Handle) -> Result<()> {
        self.lock()?.destroy(record)
    }

    pub fn is_alive(&self, record: Handle) -> bool {
        self.core
            .lock()
            .map(|core| core.records.contains_key(&record))
            .unwrap_or(false)
    }

    pub fn model_of(&self, record: Handle) -> Result<String> {
        let core = self.lock()?;
        let model = core.record(record)?.model;
        Ok(core.schema.model(model).name().to_owned())
    }

    /// Handles of every live record of a model.
    pub fn live_records(&self, model: &str) -> Result<Vec<Handle>> {
        let core = self.lock()?;
        let id = core.schema.model_id(model)?;
        Ok(core.live[id as usize].iter().collect())
    }

    pub fn record_count(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }
}
