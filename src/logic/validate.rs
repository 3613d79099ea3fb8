//! Row validation against the catalog.
//!
//! Runs before any lookup or insert, so that a row which could never be
//! stored is refused with a precise reason instead of a backend error.

use crate::error::ValidationFailure;
use crate::model::{parse_remote_id, EntityKind, FieldType, Row, Scalar};

/// Apply column defaults, then check and normalise every field of `row`.
pub fn prepare(kind: EntityKind, row: &mut Row) -> Result<(), ValidationFailure> {
    let spec = kind.spec();

    for field in spec.fields {
        if let Some(default) = field.default {
            row.entry(field.name.to_string())
                .or_insert_with(|| Scalar::from(default));
        }
    }

    if let Some(unknown) = row.keys().find(|name| spec.field(name).is_none()) {
        return Err(ValidationFailure::UnknownField {
            kind,
            field: unknown.clone(),
        });
    }

    normalise(kind, row)?;

    if let Some(relation) = spec
        .relations
        .iter()
        .find(|r| r.required && r.fields.iter().any(|f| !row.contains_key(*f)))
    {
        return Err(ValidationFailure::MissingRelation {
            kind,
            relation: relation.name,
        });
    }

    if let Some(field) = spec
        .fields
        .iter()
        .find(|f| f.required && !row.contains_key(f.name))
    {
        return Err(ValidationFailure::MissingField {
            kind,
            field: field.name,
        });
    }

    check(kind, row)
}

/// Type-check the known fields present in `row` and bring them to their
/// canonical form, so that equal rows compare equal: integers given for
/// numeric columns become numbers and uuid columns given as text are parsed,
/// with the `N:dataset:` prefix stripped. Numbers must be finite.
pub fn normalise(kind: EntityKind, row: &mut Row) -> Result<(), ValidationFailure> {
    for field in kind.spec().fields {
        let Some(value) = row.get_mut(field.name) else {
            continue;
        };
        let mismatch = ValidationFailure::TypeMismatch {
            kind,
            field: field.name,
            expected: field.ty.describe(),
        };
        let normalised = match (field.ty, &*value) {
            (FieldType::Number, Scalar::Number(n)) if !n.is_finite() => return Err(mismatch),
            (FieldType::Int, Scalar::Int(_))
            | (FieldType::Number, Scalar::Number(_))
            | (FieldType::Text, Scalar::Text(_))
            | (FieldType::Uuid, Scalar::Uuid(_))
            | (FieldType::Json, Scalar::Json(_)) => None,
            (FieldType::Number, Scalar::Int(i)) => Some(Scalar::Number(*i as f64)),
            (FieldType::Uuid, Scalar::Text(s)) => {
                Some(Scalar::Uuid(parse_remote_id(s).map_err(|_| mismatch)?))
            }
            (FieldType::Enum(allowed), Scalar::Text(s)) => {
                if !allowed.contains(&s.as_str()) {
                    return Err(ValidationFailure::InvalidEnum {
                        kind,
                        field: field.name,
                        value: s.clone(),
                    });
                }
                None
            }
            _ => return Err(mismatch),
        };
        if let Some(normalised) = normalised {
            *value = normalised;
        }
    }
    Ok(())
}

fn text<'a>(row: &'a Row, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Scalar::as_text)
}

fn violated(
    kind: EntityKind,
    constraint: &'static str,
    message: impl Into<String>,
) -> ValidationFailure {
    ValidationFailure::Check {
        kind,
        constraint,
        message: message.into(),
    }
}

/// Table check constraints.
fn check(kind: EntityKind, row: &Row) -> Result<(), ValidationFailure> {
    match kind {
        EntityKind::Object => {
            let id_type = text(row, "id_type");
            if id_type == Some("package") && !row.contains_key("id_file") {
                return Err(violated(
                    kind,
                    "constraint_objects_remote_id_type_id_package",
                    "packages need an id_file",
                ));
            }
            if id_type == Some("quantdb") && row.get("id_internal") != row.get("id") {
                return Err(violated(
                    kind,
                    "constraint_objects_remote_id_type_id_internal",
                    "quantdb objects need id_internal equal to id",
                ));
            }
        }
        EntityKind::ValueInst => check_instance(row)?,
        EntityKind::ValueCat => {
            if !row.contains_key("value_open") && !row.contains_key("value_controlled") {
                return Err(violated(
                    kind,
                    "constraint_values_cat_some_value",
                    "one of value_open or value_controlled is required",
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_instance(row: &Row) -> Result<(), ValidationFailure> {
    let kind = EntityKind::ValueInst;
    let id_sub = text(row, "id_sub");
    let id_sam = text(row, "id_sam");
    let id_formal = text(row, "id_formal");

    if id_sub.is_some_and(|s| !s.starts_with("sub-")) {
        return Err(violated(kind, "values_inst_id_sub_check", "id_sub must start with sub-"));
    }
    if id_sam.is_some_and(|s| !s.starts_with("sam-")) {
        return Err(violated(kind, "values_inst_id_sam_check", "id_sam must start with sam-"));
    }
    let Some(id_formal) = id_formal else {
        return Err(ValidationFailure::MissingField {
            kind,
            field: "id_formal",
        });
    };

    match text(row, "type") {
        Some("subject") => {
            if id_sam.is_some() || id_sub != Some(id_formal) {
                return Err(violated(
                    kind,
                    "constraint_values_inst_type_id_sub",
                    "subjects use id_sub as id_formal and have no id_sam",
                ));
            }
        }
        Some("sample") => {
            if id_sam != Some(id_formal) {
                return Err(violated(
                    kind,
                    "constraint_values_inst_type_id_sam",
                    "samples use id_sam as id_formal",
                ));
            }
        }
        _ => {
            if id_formal.starts_with("sub-") || id_formal.starts_with("sam-") {
                return Err(violated(
                    kind,
                    "constraint_values_inst_type_id_formal",
                    "regions below a sample cannot use a sub- or sam- id_formal",
                ));
            }
        }
    }
    Ok(())
}
