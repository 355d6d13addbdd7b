//! The full pipeline for one query: probe, explain, catalog, metadata.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use typeprobe_pg::MessageChannel;

use crate::catalog::resolve_catalog;
use crate::error::{TypeprobeError, TypeprobeResult};
use crate::explain::validate;
use crate::metadata::{resolve_comments, resolve_nullability};
use crate::probe::probe;
use crate::types::{
    InferOptions, MappableType, Outcome, ParamMetadata, QueryTypesResult, ReturnType,
};

/// Infer parameter and result types of `sql`, explain check included.
///
/// `mapping` (1-based placeholder index to name) is passed through untouched.
pub async fn infer<C>(
    sql: &str,
    mapping: BTreeMap<usize, String>,
    channel: &mut C,
) -> TypeprobeResult<Outcome<QueryTypesResult>>
where
    C: MessageChannel + ?Sized,
{
    infer_with(sql, mapping, &InferOptions::default(), channel).await
}

pub async fn infer_with<C>(
    sql: &str,
    mapping: BTreeMap<usize, String>,
    options: &InferOptions,
    channel: &mut C,
) -> TypeprobeResult<Outcome<QueryTypesResult>>
where
    C: MessageChannel + ?Sized,
{
    let raw = probe(sql, channel).await?;

    if options.explain {
        if let Outcome::ServerError(e) = validate(sql, &raw, channel).await? {
            return Ok(Outcome::ServerError(e));
        }
    }

    let description = match raw {
        Outcome::Ok(description) => description,
        Outcome::ServerError(e) => return Ok(Outcome::ServerError(e)),
    };

    let oids: BTreeSet<u32> = description
        .params
        .iter()
        .copied()
        .chain(description.fields.iter().map(|field| field.type_oid))
        .collect();
    let types = resolve_catalog(&oids, channel).await?;
    let comments: BTreeMap<_, _> = resolve_comments(&description.fields, channel)
        .await?
        .into_iter()
        .map(|comment| (comment.key(), comment.comment))
        .collect();
    let attributes = resolve_nullability(&description.fields, channel).await?;

    let lookup = |oid: u32| -> TypeprobeResult<MappableType> {
        types
            .get(&oid)
            .cloned()
            .ok_or(TypeprobeError::UnknownType(oid))
    };

    let params = description
        .params
        .iter()
        .map(|oid| lookup(*oid))
        .collect::<TypeprobeResult<Vec<_>>>()?;

    let mut return_types = Vec::with_capacity(description.fields.len());
    for field in &description.fields {
        let key = field.column_key();
        let attribute = key.and_then(|key| attributes.get(&key));
        return_types.push(ReturnType {
            return_name: field.name.clone(),
            column_name: attribute
                .map(|attribute| attribute.name.clone())
                .unwrap_or_else(|| field.name.clone()),
            type_: lookup(field.type_oid)?,
            nullable: attribute.is_none_or(|attribute| !attribute.not_null),
            comment: key.and_then(|key| comments.get(&key).cloned()),
        });
    }

    debug!(params = params.len(), columns = return_types.len(), "inferred");
    Ok(Outcome::Ok(QueryTypesResult {
        param_metadata: ParamMetadata { params, mapping },
        return_types,
    }))
}
