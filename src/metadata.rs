//! Column comments and nullability for result fields that read a table
//! column directly.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use typeprobe_pg::MessageChannel;

use crate::error::{TypeprobeError, TypeprobeResult};
use crate::query::{Row, run_query};
use crate::types::{ColumnAttribute, ColumnComment, ColumnKey, TypeField};

/// Distinct table columns behind `fields`, skipping computed fields.
pub fn column_keys(fields: &[TypeField]) -> BTreeSet<ColumnKey> {
    fields.iter().filter_map(TypeField::column_key).collect()
}

/// `(rel = t AND num = n) OR ...` over `keys`.
fn pair_predicate(keys: &BTreeSet<ColumnKey>, rel_column: &str, num_column: &str) -> String {
    keys.iter()
        .map(|key| {
            format!(
                "({} = {} AND {} = {})",
                rel_column, key.table_oid, num_column, key.column_attr
            )
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

pub fn comments_query(keys: &BTreeSet<ColumnKey>) -> String {
    format!(
        "SELECT objoid, objsubid, description FROM pg_description \
         WHERE classoid = 'pg_class'::regclass AND ({})",
        pair_predicate(keys, "objoid", "objsubid")
    )
}

pub fn attributes_query(keys: &BTreeSet<ColumnKey>) -> String {
    format!(
        "SELECT attrelid, attnum, attname, attnotnull FROM pg_attribute WHERE {}",
        pair_predicate(keys, "attrelid", "attnum")
    )
}

/// Column comments for the table columns behind `fields`.
pub async fn resolve_comments<C>(
    fields: &[TypeField],
    channel: &mut C,
) -> TypeprobeResult<Vec<ColumnComment>>
where
    C: MessageChannel + ?Sized,
{
    let keys = column_keys(fields);
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    debug!(columns = keys.len(), "resolving column comments");
    run_query(&comments_query(&keys), channel)
        .await?
        .into_iter()
        .map(|row| {
            let (key, mut rest) = split_key(row, 3, "pg_description")?;
            Ok(ColumnComment {
                table_oid: key.table_oid,
                column_attr: key.column_attr,
                comment: rest.pop().flatten().unwrap_or_default(),
            })
        })
        .collect()
}

/// Name and NOT NULL flag of the table columns behind `fields`.
pub async fn resolve_nullability<C>(
    fields: &[TypeField],
    channel: &mut C,
) -> TypeprobeResult<BTreeMap<ColumnKey, ColumnAttribute>>
where
    C: MessageChannel + ?Sized,
{
    let keys = column_keys(fields);
    if keys.is_empty() {
        return Ok(BTreeMap::new());
    }

    debug!(columns = keys.len(), "resolving column nullability");
    run_query(&attributes_query(&keys), channel)
        .await?
        .into_iter()
        .map(|row| {
            let (key, rest) = split_key(row, 4, "pg_attribute")?;
            let [name, not_null]: [Option<String>; 2] = rest
                .try_into()
                .map_err(|_| TypeprobeError::catalog("pg_attribute row is malformed"))?;
            let attribute = ColumnAttribute {
                name: name.unwrap_or_default(),
                not_null: not_null.as_deref() == Some("t"),
            };
            Ok((key, attribute))
        })
        .collect()
}

/// Leading `(oid, attnum)` of a catalog row, and the remaining columns.
fn split_key(mut row: Row, width: usize, table: &str) -> TypeprobeResult<(ColumnKey, Row)> {
    if row.len() != width {
        return Err(TypeprobeError::catalog(format!(
            "{} row has {} columns, expected {}",
            table,
            row.len(),
            width
        )));
    }
    let rest = row.split_off(2);
    let parse = |value: &Option<String>| {
        value
            .as_deref()
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| TypeprobeError::catalog(format!("{} row has a bad column key", table)))
    };
    let table_oid = u32::try_from(parse(&row[0])?)
        .map_err(|_| TypeprobeError::catalog(format!("{} row has a bad table oid", table)))?;
    let column_attr = i16::try_from(parse(&row[1])?)
        .map_err(|_| TypeprobeError::catalog(format!("{} row has a bad attribute number", table)))?;
    Ok((
        ColumnKey {
            table_oid,
            column_attr,
        },
        rest,
    ))
}
