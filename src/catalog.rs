//! Type oid resolution against `pg_type` / `pg_enum`.
//!
//! Enums come back as one row per label, so rows are folded in two passes:
//! first every enum collects its labels, then each oid is typed, wrapping
//! arrays of enums around the enum they contain.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use typeprobe_pg::MessageChannel;

use crate::error::{TypeprobeError, TypeprobeResult};
use crate::query::{Row, run_query};
use crate::types::{MappableType, TypeRow};

/// `typtype` of enum types
const ENUM_KIND: &str = "e";
/// `typcategory` of array types
const ARRAY_CATEGORY: &str = "A";

/// Catalog rows for `oids` and the element types of any arrays among them.
pub fn catalog_query(oids: &BTreeSet<u32>) -> String {
    let list = oids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT t.oid, t.typname, t.typtype, e.enumlabel, t.typcategory, t.typelem \
         FROM pg_type t LEFT JOIN pg_enum e ON e.enumtypid = t.oid \
         WHERE t.oid IN ({list}) \
         OR t.oid IN (SELECT typelem FROM pg_type WHERE oid IN ({list})) \
         ORDER BY t.oid, e.enumsortorder",
        list = list
    )
}

/// Map every oid in `oids` to its type. No query is sent for an empty set.
pub async fn resolve_catalog<C>(
    oids: &BTreeSet<u32>,
    channel: &mut C,
) -> TypeprobeResult<BTreeMap<u32, MappableType>>
where
    C: MessageChannel + ?Sized,
{
    if oids.is_empty() {
        return Ok(BTreeMap::new());
    }

    debug!(oids = oids.len(), "resolving catalog types");
    let rows = run_query(&catalog_query(oids), channel).await?;
    let rows = rows
        .into_iter()
        .map(parse_type_row)
        .collect::<TypeprobeResult<Vec<_>>>()?;

    let types = aggregate(&rows)?;
    if let Some(missing) = oids.iter().find(|oid| !types.contains_key(oid)) {
        return Err(TypeprobeError::UnknownType(*missing));
    }
    Ok(types)
}

fn parse_type_row(row: Row) -> TypeprobeResult<TypeRow> {
    let columns: [Option<String>; 6] = row.try_into().map_err(|row: Row| {
        TypeprobeError::catalog(format!("expected 6 columns, got {}", row.len()))
    })?;
    let [oid, type_name, type_kind, enum_label, type_category, element_type_oid] = columns;

    Ok(TypeRow {
        oid: parse_oid(oid, "oid")?,
        type_name: required(type_name, "typname")?,
        type_kind: required(type_kind, "typtype")?,
        enum_label,
        type_category: required(type_category, "typcategory")?,
        element_type_oid: parse_oid(element_type_oid, "typelem")?,
    })
}

fn required(value: Option<String>, column: &str) -> TypeprobeResult<String> {
    value.ok_or_else(|| TypeprobeError::catalog(format!("{} is NULL", column)))
}

fn parse_oid(value: Option<String>, column: &str) -> TypeprobeResult<u32> {
    let value = required(value, column)?;
    value
        .parse()
        .map_err(|_| TypeprobeError::catalog(format!("{} is not an oid: {:?}", column, value)))
}

/// Enum under construction; labels keep row order.
struct EnumBuilder {
    name: String,
    labels: Vec<String>,
}

impl EnumBuilder {
    fn build(&self) -> MappableType {
        MappableType::Enum {
            name: self.name.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Fold catalog rows into one type per oid.
///
/// A non-enum oid on more than one row means the catalog answer is
/// inconsistent and is rejected.
pub fn aggregate(rows: &[TypeRow]) -> TypeprobeResult<BTreeMap<u32, MappableType>> {
    let mut enums: BTreeMap<u32, EnumBuilder> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.type_kind == ENUM_KIND) {
        let builder = enums.entry(row.oid).or_insert_with(|| EnumBuilder {
            name: row.type_name.clone(),
            labels: Vec::new(),
        });
        if let Some(label) = &row.enum_label {
            builder.labels.push(label.clone());
        }
    }

    let mut types = BTreeMap::new();
    for row in rows {
        if let Some(builder) = enums.get(&row.oid) {
            types.entry(row.oid).or_insert_with(|| builder.build());
            continue;
        }

        let ty = match enums.get(&row.element_type_oid) {
            Some(element) if row.type_category == ARRAY_CATEGORY => MappableType::Array {
                name: row.type_name.clone(),
                element_type: Box::new(element.build()),
            },
            _ => MappableType::scalar(&row.type_name),
        };
        if types.insert(row.oid, ty).is_some() {
            return Err(TypeprobeError::catalog(format!(
                "type oid {} ({}) appears on more than one row",
                row.oid, row.type_name
            )));
        }
    }
    Ok(types)
}
