use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{LatticeError, Result};
use crate::graph::{Handle, OtherHasher, Scope};
use crate::value::{Value, ValueKind};

// Model and field positions are resolved once at seal time; everything
// downstream works with these indexes instead of names.
pub type ModelId = u16;
pub type FieldId = u16;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Outcome of a computed field's function.
pub enum Derived {
    /// Store this value in the attribute field.
    Value(Value),
    /// Point the single relation at this record.
    Target(Handle),
    /// Point the multi relation at exactly these records.
    Targets(Vec<Handle>),
    /// Reset the field to its declared default (attributes) or unlink
    /// everything (relations).
    Clear,
}

/// A computed field's function. It receives a [`Scope`] through which every
/// read is dependency-tracked, and must be a pure function of what it reads.
pub type ComputeFn = Arc<dyn Fn(&mut Scope<'_>) -> Result<Derived> + Send + Sync>;

/// Declared kind of a field, with relation targets still by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Attribute(ValueKind),
    One { target: String, inverse: Option<String> },
    Many { target: String, inverse: Option<String> },
}

/// A field as declared by the caller, before registration.
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub default: Option<Value>,
    pub compute: Option<ComputeFn>,
    /// Declared `computed` in a schema script; a computation is expected to
    /// be attached before the engine is built.
    pub expects_compute: bool,
    pub readonly: bool,
    pub required: bool,
}

impl FieldDef {
    pub fn attr(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_owned(),
            kind: FieldKind::Attribute(kind),
            default: None,
            compute: None,
            expects_compute: false,
            readonly: false,
            required: false,
        }
    }
    pub fn one(name: &str, target: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: FieldKind::One { target: target.to_owned(), inverse: None },
            default: None,
            compute: None,
            expects_compute: false,
            readonly: false,
            required: false,
        }
    }
    pub fn many(name: &str, target: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: FieldKind::Many { target: target.to_owned(), inverse: None },
            default: None,
            compute: None,
            expects_compute: false,
            readonly: false,
            required: false,
        }
    }
    pub fn inverse(mut self, inverse: &str) -> Self {
        match &mut self.kind {
            FieldKind::One { inverse: slot, .. } | FieldKind::Many { inverse: slot, .. } => {
                *slot = Some(inverse.to_owned());
            }
            FieldKind::Attribute(_) => (),
        }
        self
    }
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
    pub fn compute<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Derived> + Send + Sync + 'static,
    {
        self.compute = Some(Arc::new(f));
        self
    }
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("computed", &self.compute.is_some())
            .field("readonly", &self.readonly)
            .field("required", &self.required)
            .finish()
    }
}

/// A model as declared by the caller: named fields plus an optional
/// identifying tuple.
#[derive(Debug)]
pub struct ModelDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub identifying: Vec<String>,
}

impl ModelDef {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_owned(), fields: Vec::new(), identifying: Vec::new() }
    }
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
    pub fn identified_by(mut self, fields: &[&str]) -> Self {
        self.identifying = fields.iter().map(|f| (*f).to_owned()).collect();
        self
    }
}

/// Resolved kind of a field: relation targets and inverses by index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldWiring {
    Attribute(ValueKind),
    One { target: ModelId, inverse: Option<FieldId> },
    Many { target: ModelId, inverse: Option<FieldId> },
}

impl FieldWiring {
    pub fn is_relation(&self) -> bool {
        !matches!(self, FieldWiring::Attribute(_))
    }
    pub fn target(&self) -> Option<ModelId> {
        match self {
            FieldWiring::One { target, .. } | FieldWiring::Many { target, .. } => Some(*target),
            FieldWiring::Attribute(_) => None,
        }
    }
    pub fn inverse(&self) -> Option<FieldId> {
        match self {
            FieldWiring::One { inverse, .. } | FieldWiring::Many { inverse, .. } => *inverse,
            FieldWiring::Attribute(_) => None,
        }
    }
    pub fn value_kind(&self) -> Option<ValueKind> {
        match self {
            FieldWiring::Attribute(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// A field after seal: wiring resolved, compute attached.
pub struct FieldMeta {
    name: String,
    wiring: FieldWiring,
    default: Option<Value>,
    compute: Option<ComputeFn>,
    readonly: bool,
    required: bool,
}

impl FieldMeta {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn wiring(&self) -> FieldWiring {
        self.wiring
    }
    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
    pub fn compute(&self) -> Option<&ComputeFn> {
        self.compute.as_ref()
    }
    pub fn is_computed(&self) -> bool {
        self.compute.is_some()
    }
    pub fn readonly(&self) -> bool {
        self.readonly
    }
    pub fn required(&self) -> bool {
        self.required
    }
}

impl fmt::Debug for FieldMeta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FieldMeta")
            .field("name", &self.name)
            .field("wiring", &self.wiring)
            .field("computed", &self.compute.is_some())
            .finish()
    }
}

/// A model after seal.
#[derive(Debug)]
pub struct ModelSchema {
    name: String,
    fields: Vec<FieldMeta>,
    by_name: HashMap<String, FieldId, OtherHasher>,
    identifying: Vec<FieldId>,
}

impl ModelSchema {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn field_id(&self, name: &str) -> Result<FieldId> {
        self.by_name.get(name).copied().ok_or_else(|| {
            LatticeError::Schema(format!("no field '{}' on model '{}'", name, self.name))
        })
    }
    pub fn field(&self, id: FieldId) -> &FieldMeta {
        &self.fields[id as usize]
    }
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &FieldMeta)> {
        self.fields.iter().enumerate().map(|(i, f)| (i as FieldId, f))
    }
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
    pub fn identifying(&self) -> &[FieldId] {
        &self.identifying
    }
    pub fn is_identifying(&self, field: FieldId) -> bool {
        self.identifying.contains(&field)
    }
    pub fn is_singleton(&self) -> bool {
        !self.identifying.is_empty()
    }
}

/// The sealed schema an engine is built from.
#[derive(Debug)]
pub struct Schema {
    models: Vec<ModelSchema>,
    by_name: HashMap<String, ModelId, OtherHasher>,
}

impl Schema {
    pub fn model_id(&self, name: &str) -> Result<ModelId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| LatticeError::Schema(format!("unknown model '{}'", name)))
    }
    pub fn model(&self, id: ModelId) -> &ModelSchema {
        &self.models[id as usize]
    }
    pub fn models(&self) -> impl Iterator<Item = (ModelId, &ModelSchema)> {
        self.models.iter().enumerate().map(|(i, m)| (i as ModelId, m))
    }
    pub fn model_count(&self) -> usize {
        self.models.len()
    }
}

/// Collects model definitions and validates them into a [`Schema`].
///
/// Per-model problems (bad identifiers, duplicate fields, unknown
/// identifying entries, duplicate model names) are rejected at
/// [`register`](Catalog::register). Cross-model wiring is also checked
/// there whenever the counterpart model is already present; anything still
/// open resolves at seal time, so mutually referential models may register
/// in either order.
#[derive(Debug, Default)]
pub struct Catalog {
    defs: Vec<ModelDef>,
    by_name: HashMap<String, usize, OtherHasher>,
}

impl Catalog {
    pub fn new() -> Self {
        Self { defs: Vec::new(), by_name: HashMap::default() }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Register one model definition.
    pub fn register(&mut self, def: ModelDef) -> Result<()> {
        if !IDENTIFIER.is_match(&def.name) {
            return Err(LatticeError::Schema(format!("invalid model name '{}'", def.name)));
        }
        if def.fields.len() > FieldId::MAX as usize {
            return Err(LatticeError::Schema(format!(
                "model '{}' declares too many fields",
                def.name
            )));
        }
        let mut seen: HashMap<&str, (), OtherHasher> = HashMap::default();
        for field in &def.fields {
            if !IDENTIFIER.is_match(&field.name) {
                return Err(LatticeError::Schema(format!(
                    "invalid field name '{}' on model '{}'",
                    field.name, def.name
                )));
            }
            if seen.insert(&field.name, ()).is_some() {
                return Err(LatticeError::Schema(format!(
                    "duplicate field '{}' on model '{}'",
                    field.name, def.name
                )));
            }
            if let Some(default) = &field.default {
                match field.kind {
                    FieldKind::Attribute(kind) if default.fits(kind) => (),
                    FieldKind::Attribute(kind) => {
                        return Err(LatticeError::Schema(format!(
                            "default for '{}.{}' does not fit declared kind {}",
                            def.name, field.name, kind
                        )));
                    }
                    _ => {
                        return Err(LatticeError::Schema(format!(
                            "relation field '{}.{}' cannot declare a default",
                            def.name, field.name
                        )));
                    }
                }
            }
        }
        for name in &def.identifying {
            let field = def.fields.iter().find(|f| f.name == *name).ok_or_else(|| {
                LatticeError::Schema(format!(
                    "identifying field '{}' is not declared on model '{}'",
                    name, def.name
                ))
            })?;
            if matches!(field.kind, FieldKind::Many { .. }) {
                return Err(LatticeError::Schema(format!(
                    "identifying field '{}.{}' cannot be a multi relation",
                    def.name, name
                )));
            }
            if field.compute.is_some() {
                return Err(LatticeError::Schema(format!(
                    "identifying field '{}.{}' cannot be computed",
                    def.name, name
                )));
            }
        }
        if self.by_name.contains_key(&def.name) {
            return Err(LatticeError::DuplicateModel(def.name));
        }
        self.cross_check(&def)?;
        self.by_name.insert(def.name.clone(), self.defs.len());
        info!(model = %def.name, fields = def.fields.len(), "registered model");
        self.defs.push(def);
        Ok(())
    }

    /// Parse a schema script (see the grammar in `schema.pest`) and register
    /// every model it declares.
    pub fn define(&mut self, script: &str) -> Result<()> {
        for def in crate::dsl::parse(script)? {
            self.register(def)?;
        }
        Ok(())
    }

    /// Attach a computation to a declared field, e.g. one that the schema
    /// script marked `computed`. Must happen before the engine is built.
    pub fn attach_compute<F>(&mut self, model: &str, field: &str, f: F) -> Result<()>
    where
        F: Fn(&mut Scope<'_>) -> Result<Derived> + Send + Sync + 'static,
    {
        let idx = *self
            .by_name
            .get(model)
            .ok_or_else(|| LatticeError::Schema(format!("unknown model '{}'", model)))?;
        let def = &mut self.defs[idx];
        if def.identifying.iter().any(|n| n == field) {
            return Err(LatticeError::Schema(format!(
                "identifying field '{}.{}' cannot be computed",
                model, field
            )));
        }
        let slot = def.fields.iter_mut().find(|fd| fd.name == field).ok_or_else(|| {
            LatticeError::Schema(format!("no field '{}' on model '{}'", field, model))
        })?;
        slot.compute = Some(Arc::new(f));
        debug!(model, field, "attached computation");
        Ok(())
    }

    // Inverse declarations that already have their counterpart model present
    // fail fast here; the seal pass re-checks everything authoritatively.
    fn cross_check(&self, def: &ModelDef) -> Result<()> {
        for field in &def.fields {
            let (target, inverse) = match &field.kind {
                FieldKind::One { target, inverse } | FieldKind::Many { target, inverse } => {
                    (target, inverse)
                }
                FieldKind::Attribute(_) => continue,
            };
            let Some(inverse) = inverse else { continue };
            let target_def = if target == &def.name {
                def
            } else {
                match self.by_name.get(target) {
                    Some(idx) => &self.defs[*idx],
                    None => continue,
                }
            };
            check_inverse_declaration(&def.name, &field.name, target_def, inverse)?;
        }
        // Mirror direction: previously registered models pointing here.
        for prior in &self.defs {
            for field in &prior.fields {
                let (target, inverse) = match &field.kind {
                    FieldKind::One { target, inverse } | FieldKind::Many { target, inverse } => {
                        (target, inverse)
                    }
                    FieldKind::Attribute(_) => continue,
                };
                if target != &def.name {
                    continue;
                }
                if let Some(inverse) = inverse {
                    check_inverse_declaration(&prior.name, &field.name, def, inverse)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve every name to an index, pair up inverses, and produce the
    /// sealed schema.
    pub(crate) fn seal(self) -> Result<Schema> {
        if self.defs.len() > ModelId::MAX as usize {
            return Err(LatticeError::Schema("too many models".to_owned()));
        }
        let model_ids: HashMap<String, ModelId, OtherHasher> = self
            .by_name
            .iter()
            .map(|(name, idx)| (name.clone(), *idx as ModelId))
            .collect();

        // First pass: every declared inverse claims a field on the target
        // model. Two fields claiming the same counterpart is a conflict, as
        // is a counterpart whose own declaration points elsewhere.
        let mut claims: HashMap<(ModelId, FieldId), (ModelId, FieldId), OtherHasher> =
            HashMap::default();
        for (m, def) in self.defs.iter().enumerate() {
            for (f, field) in def.fields.iter().enumerate() {
                let (target, inverse) = match &field.kind {
                    FieldKind::One { target, inverse } | FieldKind::Many { target, inverse } => {
                        (target, inverse)
                    }
                    FieldKind::Attribute(_) => continue,
                };
                let target_id = *model_ids.get(target).ok_or_else(|| {
                    LatticeError::Schema(format!(
                        "field '{}.{}' targets unknown model '{}'",
                        def.name, field.name, target
                    ))
                })?;
                let Some(inverse) = inverse else { continue };
                let target_def = &self.defs[target_id as usize];
                check_inverse_declaration(&def.name, &field.name, target_def, inverse)?;
                let g = target_def.fields.iter().position(|fd| fd.name == *inverse).ok_or_else(
                    || {
                        LatticeError::Schema(format!(
                            "inverse '{}' of '{}.{}' does not exist on model '{}'",
                            inverse, def.name, field.name, target
                        ))
                    },
                )? as FieldId;
                let this = (m as ModelId, f as FieldId);
                let other = (target_id, g);
                if let Some(prior) = claims.insert(other, this) {
                    if prior != this {
                        let (pm, pf) = prior;
                        return Err(LatticeError::Schema(format!(
                            "field '{}.{}' is claimed as inverse by both '{}.{}' and '{}.{}'",
                            target,
                            inverse,
                            self.defs[pm as usize].name,
                            self.defs[pm as usize].fields[pf as usize].name,
                            def.name,
                            field.name
                        )));
                    }
                }
                // A one-sided declaration is paired up automatically; an
                // explicit declaration on both sides must agree, which
                // check_inverse_declaration has already established.
                claims.insert(this, other);
            }
        }

        let mut models = Vec::with_capacity(self.defs.len());
        for (m, def) in self.defs.into_iter().enumerate() {
            let mut by_name: HashMap<String, FieldId, OtherHasher> = HashMap::default();
            let identifying: Vec<FieldId> = def
                .identifying
                .iter()
                .map(|name| {
                    def.fields.iter().position(|fd| fd.name == *name).map(|i| i as FieldId)
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| LatticeError::Invariant("identifying field vanished".to_owned()))?;
            let mut fields = Vec::with_capacity(def.fields.len());
            for (f, field) in def.fields.into_iter().enumerate() {
                if field.expects_compute && field.compute.is_none() {
                    warn!(
                        model = %def.name,
                        field = %field.name,
                        "field was declared computed but no computation is attached"
                    );
                }
                by_name.insert(field.name.clone(), f as FieldId);
                let inverse_of = claims.get(&(m as ModelId, f as FieldId)).map(|(_, g)| *g);
                let wiring = match &field.kind {
                    FieldKind::Attribute(kind) => FieldWiring::Attribute(*kind),
                    FieldKind::One { target, .. } => FieldWiring::One {
                        target: model_ids[target],
                        inverse: inverse_of,
                    },
                    FieldKind::Many { target, .. } => FieldWiring::Many {
                        target: model_ids[target],
                        inverse: inverse_of,
                    },
                };
                fields.push(FieldMeta {
                    name: field.name,
                    wiring,
                    default: field.default,
                    compute: field.compute,
                    readonly: field.readonly,
                    required: field.required,
                });
            }
            models.push(ModelSchema { name: def.name, fields, by_name, identifying });
        }
        let schema = Schema {
            by_name: model_ids,
            models,
        };
        info!(models = schema.model_count(), "sealed schema");
        Ok(schema)
    }
}

fn check_inverse_declaration(
    owner_model: &str,
    owner_field: &str,
    target_def: &ModelDef,
    inverse: &str,
) -> Result<()> {
    let Some(counterpart) = target_def.fields.iter().find(|fd| fd.name == *inverse) else {
        return Err(LatticeError::Schema(format!(
            "inverse '{}' of '{}.{}' does not exist on model '{}'",
            inverse, owner_model, owner_field, target_def.name
        )));
    };
    match &counterpart.kind {
        FieldKind::Attribute(_) => Err(LatticeError::Schema(format!(
            "inverse '{}.{}' of '{}.{}' is an attribute, not a relation",
            target_def.name, inverse, owner_model, owner_field
        ))),
        FieldKind::One { target, inverse: back } | FieldKind::Many { target, inverse: back } => {
            if target != owner_model {
                return Err(LatticeError::Schema(format!(
                    "inverse '{}.{}' of '{}.{}' targets '{}' instead of '{}'",
                    target_def.name, inverse, owner_model, owner_field, target, owner_model
                )));
            }
            if let Some(back) = back {
                if back != owner_field {
                    return Err(LatticeError::Schema(format!(
                        "inverse '{}.{}' points back at '{}.{}', not '{}.{}'",
                        target_def.name, inverse, owner_model, back, owner_model, owner_field
                    )));
                }
            }
            Ok(())
        }
    }
}
