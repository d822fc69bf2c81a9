//! The schema definition language.
//!
//! A script is a sequence of `model` blocks; each declares attributes,
//! relations with optional inverses, and an optional identifying tuple.
//! Scripts only carry structure; computations are closures and are
//! attached through [`Catalog::attach_compute`](crate::schema::Catalog).

use bigdecimal::BigDecimal;
use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::error::{LatticeError, Result};
use crate::schema::{FieldDef, ModelDef};
use crate::value::{Value, ValueKind};

#[derive(Parser)]
#[grammar = "schema.pest"]
struct SchemaParser;

/// Parse a schema script into model definitions, in declaration order.
pub fn parse(script: &str) -> Result<Vec<ModelDef>> {
    let mut pairs = SchemaParser::parse(Rule::script, script).map_err(|e| {
        let (line, col) = match e.line_col {
            pest::error::LineColLocation::Pos((line, col)) => (Some(line), Some(col)),
            pest::error::LineColLocation::Span((line, col), _) => (Some(line), Some(col)),
        };
        LatticeError::Parse { message: e.variant.message().into_owned(), line, col }
    })?;
    let root = pairs
        .next()
        .ok_or_else(|| LatticeError::Invariant("empty parse result".to_owned()))?;
    let mut defs = Vec::new();
    for pair in root.into_inner() {
        match pair.as_rule() {
            Rule::model => defs.push(parse_model(pair)?),
            Rule::EOI => (),
            other => {
                return Err(LatticeError::Invariant(format!(
                    "unexpected rule {:?} at script level",
                    other
                )));
            }
        }
    }
    Ok(defs)
}

fn parse_model(pair: Pair<Rule>) -> Result<ModelDef> {
    let mut inner = pair.into_inner();
    let name = expect_ident(inner.next())?;
    let mut def = ModelDef::new(&name);
    for item in inner {
        match item.as_rule() {
            Rule::identified => {
                def.identifying = item.into_inner().map(|p| p.as_str().to_owned()).collect();
            }
            Rule::attr_field => def.fields.push(parse_attr(item)?),
            Rule::one_field => def.fields.push(parse_relation(item, false)?),
            Rule::many_field => def.fields.push(parse_relation(item, true)?),
            other => {
                return Err(LatticeError::Invariant(format!(
                    "unexpected rule {:?} in model block",
                    other
                )));
            }
        }
    }
    Ok(def)
}

fn parse_attr(pair: Pair<Rule>) -> Result<FieldDef> {
    let mut inner = pair.into_inner();
    let name = expect_ident(inner.next())?;
    let kind = match inner.next().map(|p| p.as_str().to_owned()) {
        Some(kind) => value_kind(&kind)?,
        None => {
            return Err(LatticeError::Invariant("attribute without a kind".to_owned()));
        }
    };
    let mut def = FieldDef::attr(&name, kind);
    for item in inner {
        match item.as_rule() {
            Rule::default_value => def.default = Some(parse_default(item, kind)?),
            Rule::flag => apply_flag(&mut def, item.as_str()),
            other => {
                return Err(LatticeError::Invariant(format!(
                    "unexpected rule {:?} in attribute",
                    other
                )));
            }
        }
    }
    Ok(def)
}

fn parse_relation(pair: Pair<Rule>, many: bool) -> Result<FieldDef> {
    let mut inner = pair.into_inner();
    let name = expect_ident(inner.next())?;
    let target = expect_ident(inner.next())?;
    let mut def = if many {
        FieldDef::many(&name, &target)
    } else {
        FieldDef::one(&name, &target)
    };
    for item in inner {
        match item.as_rule() {
            Rule::ident => def = def.inverse(item.as_str()),
            Rule::flag => apply_flag(&mut def, item.as_str()),
            other => {
                return Err(LatticeError::Invariant(format!(
                    "unexpected rule {:?} in relation",
                    other
                )));
            }
        }
    }
    Ok(def)
}

fn apply_flag(def: &mut FieldDef, flag: &str) {
    match flag {
        "readonly" => def.readonly = true,
        "required" => def.required = true,
        "computed" => def.expects_compute = true,
        _ => (),
    }
}

fn parse_default(pair: Pair<Rule>, kind: ValueKind) -> Result<Value> {
    let literal = pair
        .into_inner()
        .next()
        .ok_or_else(|| LatticeError::Invariant("empty default value".to_owned()))?;
    match literal.as_rule() {
        Rule::string => {
            let raw = literal.as_str();
            Ok(Value::Text(raw[1..raw.len() - 1].to_owned()))
        }
        Rule::boolean => Ok(Value::Boolean(literal.as_str() == "true")),
        Rule::integer => {
            let number: i64 = literal.as_str().parse().map_err(|_| LatticeError::Parse {
                message: format!("integer literal '{}' out of range", literal.as_str()),
                line: None,
                col: None,
            })?;
            // An integer literal on a decimal field reads as a decimal.
            if kind == ValueKind::Decimal {
                Ok(Value::Decimal(BigDecimal::from(number)))
            } else {
                Ok(Value::Integer(number))
            }
        }
        other => Err(LatticeError::Invariant(format!(
            "unexpected rule {:?} as default value",
            other
        ))),
    }
}

fn value_kind(name: &str) -> Result<ValueKind> {
    match name {
        "text" => Ok(ValueKind::Text),
        "int" | "integer" => Ok(ValueKind::Integer),
        "bool" | "boolean" => Ok(ValueKind::Boolean),
        "decimal" => Ok(ValueKind::Decimal),
        "date" => Ok(ValueKind::Date),
        "datetime" => Ok(ValueKind::DateTime),
        "json" => Ok(ValueKind::Json),
        "any" => Ok(ValueKind::Any),
        other => Err(LatticeError::Parse {
            message: format!("unknown value kind '{}'", other),
            line: None,
            col: None,
        }),
    }
}

fn expect_ident(pair: Option<Pair<Rule>>) -> Result<String> {
    match pair {
        Some(p) if p.as_rule() == Rule::ident => Ok(p.as_str().to_owned()),
        _ => Err(LatticeError::Invariant("expected an identifier".to_owned())),
    }
}
