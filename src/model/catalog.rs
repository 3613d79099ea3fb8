//! Static schema catalog.
//!
//! Every entity kind the store knows about is described here: its table, its
//! key, its columns, the relationships it declares and its unique constraint
//! sets. The resolver walks relationships in the order they are declared here,
//! which is what makes repeated ingestion runs produce identical side effects.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{Key, KeyPart, Row, Scalar};

pub const ADDRESS_TYPES: &[&str] = &[
    "constant",
    "tabular-header",
    "tabular-alt-header",
    "workbook-sheet-tabular-header",
    "workbook-sheet-tabular-alt-header",
    "json-path-with-types",
    "file-system-extracted",
    "arbitrary-function",
];
pub const FIELD_VALUE_TYPES: &[&str] = &["single", "multi"];
pub const REMOTE_ID_TYPES: &[&str] =
    &["organization", "dataset", "collection", "package", "quantdb"];
pub const CAT_RANGE_TYPES: &[&str] = &["open", "controlled"];
pub const QUANT_SHAPES: &[&str] = &["scalar"];
pub const AGGREGATION_TYPES: &[&str] = &[
    "instance", "function", "summary", "mean", "median", "mode", "sum", "min", "max",
];
pub const INSTANCE_TYPES: &[&str] = &["subject", "sample", "below"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Address,
    Aspect,
    Unit,
    ControlledTerm,
    /// Instance type, aka class.
    DescriptorInst,
    /// Categorical descriptor, aka predicate.
    DescriptorCat,
    DescriptorQuant,
    Object,
    ObjDescInst,
    ObjDescCat,
    ObjDescQuant,
    /// A subject, sample or sub-sample region.
    ValueInst,
    ValueCat,
    ValueQuant,
}

impl EntityKind {
    pub const ALL: [EntityKind; 14] = [
        EntityKind::Address,
        EntityKind::Aspect,
        EntityKind::Unit,
        EntityKind::ControlledTerm,
        EntityKind::DescriptorInst,
        EntityKind::DescriptorCat,
        EntityKind::DescriptorQuant,
        EntityKind::Object,
        EntityKind::ObjDescInst,
        EntityKind::ObjDescCat,
        EntityKind::ObjDescQuant,
        EntityKind::ValueInst,
        EntityKind::ValueCat,
        EntityKind::ValueQuant,
    ];

    pub fn spec(self) -> &'static KindSpec {
        match self {
            EntityKind::Address => &ADDRESS,
            EntityKind::Aspect => &ASPECT,
            EntityKind::Unit => &UNIT,
            EntityKind::ControlledTerm => &CONTROLLED_TERM,
            EntityKind::DescriptorInst => &DESCRIPTOR_INST,
            EntityKind::DescriptorCat => &DESCRIPTOR_CAT,
            EntityKind::DescriptorQuant => &DESCRIPTOR_QUANT,
            EntityKind::Object => &OBJECT,
            EntityKind::ObjDescInst => &OBJ_DESC_INST,
            EntityKind::ObjDescCat => &OBJ_DESC_CAT,
            EntityKind::ObjDescQuant => &OBJ_DESC_QUANT,
            EntityKind::ValueInst => &VALUE_INST,
            EntityKind::ValueCat => &VALUE_CAT,
            EntityKind::ValueQuant => &VALUE_QUANT,
        }
    }

    pub fn table(self) -> &'static str {
        self.spec().table
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Number,
    Text,
    Uuid,
    Json,
    /// Text restricted to a closed set of values.
    Enum(&'static [&'static str]),
}

impl FieldType {
    pub fn describe(&self) -> &'static str {
        match self {
            FieldType::Int => "integer",
            FieldType::Number => "number",
            FieldType::Text => "text",
            FieldType::Uuid => "uuid",
            FieldType::Json => "json",
            FieldType::Enum(_) => "enumerated text",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
    /// Server-side default, applied before lookup so lookups match inserts.
    pub default: Option<&'static str>,
}

const fn req(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec { name, ty, required: true, default: None }
}

const fn opt(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec { name, ty, required: false, default: None }
}

const fn dflt(name: &'static str, ty: FieldType, default: &'static str) -> FieldSpec {
    FieldSpec { name, ty, required: true, default: Some(default) }
}

#[derive(Debug, Clone, Copy)]
pub enum KeySpec {
    /// Generated integer column `id`.
    Serial,
    /// Caller-supplied column.
    Supplied(&'static [&'static str]),
    /// Primary key made of relationship columns.
    Composite(&'static [&'static str]),
}

/// A many-to-one relationship. `fields` are the local columns that receive
/// the target's key, in the target's key-column order; composite targets
/// (the object/descriptor mapping tables) take more than one column.
#[derive(Debug, Clone, Copy)]
pub struct RelationSpec {
    pub name: &'static str,
    pub fields: &'static [&'static str],
    pub target: EntityKind,
    pub required: bool,
}

const fn fk(fields: &'static [&'static str], target: EntityKind, required: bool) -> RelationSpec {
    // single-column foreign keys are named after their column
    RelationSpec { name: fields[0], fields, target, required }
}

impl RelationSpec {
    /// Key of the target row referenced by `row`, if every local column is set.
    pub fn target_key(&self, row: &Row) -> Option<Key> {
        let parts = self
            .fields
            .iter()
            .map(|f| row.get(*f).and_then(KeyPart::from_scalar))
            .collect::<Option<Vec<_>>>()?;
        Some(Key::from_parts(parts))
    }

    /// Local column values that reference the target row with `key`.
    pub fn columns_for(&self, key: &Key) -> Vec<(&'static str, Scalar)> {
        self.fields
            .iter()
            .copied()
            .zip(key.parts().into_iter().map(KeyPart::to_scalar))
            .collect()
    }
}

#[derive(Debug)]
pub struct KindSpec {
    pub kind: EntityKind,
    pub table: &'static str,
    pub key: KeySpec,
    pub fields: &'static [FieldSpec],
    pub relations: &'static [RelationSpec],
    /// Unique constraint sets in declaration order, primary key sets included.
    pub unique: &'static [&'static [&'static str]],
    pub hierarchy: Option<Hierarchy>,
}

impl KindSpec {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&'static RelationSpec> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn key_columns(&self) -> &'static [&'static str] {
        match self.key {
            KeySpec::Serial => &["id"],
            KeySpec::Supplied(columns) | KeySpec::Composite(columns) => columns,
        }
    }

    /// Type of a key column. Serial keys are integers.
    pub fn key_type(&self, column: &str) -> FieldType {
        match self.field(column) {
            Some(field) => field.ty,
            None => FieldType::Int,
        }
    }

    /// Primary key carried by `row`. Serial kinds only have one after insert,
    /// so this returns `None` for them.
    pub fn key_from_row(&self, row: &Row) -> Option<Key> {
        match self.key {
            KeySpec::Serial => None,
            KeySpec::Supplied(columns) | KeySpec::Composite(columns) => {
                let parts = columns
                    .iter()
                    .map(|c| row.get(*c).and_then(KeyPart::from_scalar))
                    .collect::<Option<Vec<_>>>()?;
                Some(Key::from_parts(parts))
            }
        }
    }
}

/// The three self-referencing parent hierarchies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hierarchy {
    Aspect,
    Class,
    Instance,
}

impl Hierarchy {
    pub const ALL: [Hierarchy; 3] = [Hierarchy::Aspect, Hierarchy::Class, Hierarchy::Instance];

    /// Edge table with columns `id` (child) and `parent`.
    pub fn table(self) -> &'static str {
        match self {
            Hierarchy::Aspect => "aspect_parent",
            Hierarchy::Class => "class_parent",
            Hierarchy::Instance => "instance_parent",
        }
    }

    pub fn member(self) -> EntityKind {
        match self {
            Hierarchy::Aspect => EntityKind::Aspect,
            Hierarchy::Class => EntityKind::DescriptorInst,
            Hierarchy::Instance => EntityKind::ValueInst,
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Table holding instance equivalence pairs.
pub const EQUIVALENCE_TABLE: &str = "equiv_inst";

use EntityKind as K;
use FieldType as T;

static ADDRESS: KindSpec = KindSpec {
    kind: K::Address,
    table: "addresses",
    key: KeySpec::Serial,
    fields: &[
        req("addr_type", T::Enum(ADDRESS_TYPES)),
        opt("addr_field", T::Text),
        dflt("value_type", T::Enum(FIELD_VALUE_TYPES), "single"),
        opt("curator_note", T::Text),
    ],
    relations: &[],
    unique: &[&["addr_type", "addr_field", "value_type"]],
    hierarchy: None,
};

static ASPECT: KindSpec = KindSpec {
    kind: K::Aspect,
    table: "aspects",
    key: KeySpec::Serial,
    fields: &[req("label", T::Text), req("iri", T::Text), opt("description", T::Text)],
    relations: &[],
    unique: &[&["iri"], &["label"]],
    hierarchy: Some(Hierarchy::Aspect),
};

static UNIT: KindSpec = KindSpec {
    kind: K::Unit,
    table: "units",
    key: KeySpec::Serial,
    fields: &[req("label", T::Text), req("iri", T::Text)],
    relations: &[],
    unique: &[&["iri"], &["label"]],
    hierarchy: None,
};

static CONTROLLED_TERM: KindSpec = KindSpec {
    kind: K::ControlledTerm,
    table: "controlled_terms",
    key: KeySpec::Serial,
    fields: &[req("label", T::Text), req("iri", T::Text)],
    relations: &[],
    unique: &[&["iri"], &["label"]],
    hierarchy: None,
};

static DESCRIPTOR_INST: KindSpec = KindSpec {
    kind: K::DescriptorInst,
    table: "descriptors_inst",
    key: KeySpec::Serial,
    fields: &[req("label", T::Text), req("iri", T::Text), opt("description", T::Text)],
    relations: &[],
    unique: &[&["iri"], &["label"]],
    hierarchy: Some(Hierarchy::Class),
};

static DESCRIPTOR_CAT: KindSpec = KindSpec {
    kind: K::DescriptorCat,
    table: "descriptors_cat",
    key: KeySpec::Serial,
    fields: &[
        opt("domain", T::Int),
        req("range", T::Enum(CAT_RANGE_TYPES)),
        req("label", T::Text),
        opt("description", T::Text),
        opt("curator_note", T::Text),
    ],
    relations: &[fk(&["domain"], K::DescriptorInst, false)],
    unique: &[&["domain", "range", "label"]],
    hierarchy: None,
};

static DESCRIPTOR_QUANT: KindSpec = KindSpec {
    kind: K::DescriptorQuant,
    table: "descriptors_quant",
    key: KeySpec::Serial,
    fields: &[
        dflt("shape", T::Enum(QUANT_SHAPES), "scalar"),
        req("label", T::Text),
        dflt("aggregation_type", T::Enum(AGGREGATION_TYPES), "instance"),
        opt("unit", T::Int),
        opt("aspect", T::Int),
        opt("domain", T::Int),
        opt("description", T::Text),
        opt("curator_note", T::Text),
    ],
    relations: &[
        fk(&["unit"], K::Unit, false),
        fk(&["aspect"], K::Aspect, false),
        fk(&["domain"], K::DescriptorInst, false),
    ],
    unique: &[&["label"], &["unit", "aspect", "domain", "shape", "aggregation_type"]],
    hierarchy: None,
};

static OBJECT: KindSpec = KindSpec {
    kind: K::Object,
    table: "objects",
    key: KeySpec::Supplied(&["id"]),
    fields: &[
        req("id", T::Uuid),
        req("id_type", T::Enum(REMOTE_ID_TYPES)),
        opt("id_file", T::Int),
        opt("id_internal", T::Uuid),
    ],
    relations: &[],
    unique: &[&["id"]],
    hierarchy: None,
};

static OBJ_DESC_INST: KindSpec = KindSpec {
    kind: K::ObjDescInst,
    table: "obj_desc_inst",
    key: KeySpec::Composite(&["object", "desc_inst"]),
    fields: &[
        req("object", T::Uuid),
        req("desc_inst", T::Int),
        req("addr_field", T::Int),
        opt("addr_desc_inst", T::Int),
        opt("expect", T::Int),
    ],
    relations: &[
        fk(&["object"], K::Object, true),
        fk(&["desc_inst"], K::DescriptorInst, true),
        fk(&["addr_field"], K::Address, true),
        fk(&["addr_desc_inst"], K::Address, false),
    ],
    unique: &[&["object", "desc_inst"]],
    hierarchy: None,
};

static OBJ_DESC_CAT: KindSpec = KindSpec {
    kind: K::ObjDescCat,
    table: "obj_desc_cat",
    key: KeySpec::Composite(&["object", "desc_cat"]),
    fields: &[
        req("object", T::Uuid),
        req("desc_cat", T::Int),
        req("addr_field", T::Int),
        opt("addr_desc_inst", T::Int),
        opt("expect", T::Int),
    ],
    relations: &[
        fk(&["object"], K::Object, true),
        fk(&["desc_cat"], K::DescriptorCat, true),
        fk(&["addr_field"], K::Address, true),
        fk(&["addr_desc_inst"], K::Address, false),
    ],
    unique: &[&["object", "desc_cat"]],
    hierarchy: None,
};

static OBJ_DESC_QUANT: KindSpec = KindSpec {
    kind: K::ObjDescQuant,
    table: "obj_desc_quant",
    key: KeySpec::Composite(&["object", "desc_quant"]),
    fields: &[
        req("object", T::Uuid),
        req("desc_quant", T::Int),
        req("addr_field", T::Int),
        opt("addr_unit", T::Int),
        opt("addr_aspect", T::Int),
        opt("addr_desc_inst", T::Int),
        opt("expect", T::Int),
    ],
    relations: &[
        fk(&["object"], K::Object, true),
        fk(&["desc_quant"], K::DescriptorQuant, true),
        fk(&["addr_field"], K::Address, true),
        fk(&["addr_unit"], K::Address, false),
        fk(&["addr_aspect"], K::Address, false),
        fk(&["addr_desc_inst"], K::Address, false),
    ],
    unique: &[&["object", "desc_quant"]],
    hierarchy: None,
};

static VALUE_INST: KindSpec = KindSpec {
    kind: K::ValueInst,
    table: "values_inst",
    key: KeySpec::Serial,
    fields: &[
        req("type", T::Enum(INSTANCE_TYPES)),
        req("id_sub", T::Text),
        opt("desc_inst", T::Int),
        opt("dataset", T::Uuid),
        req("id_formal", T::Text),
        opt("local_identifier", T::Text),
        opt("id_sam", T::Text),
    ],
    relations: &[
        fk(&["desc_inst"], K::DescriptorInst, false),
        fk(&["dataset"], K::Object, false),
    ],
    unique: &[&["dataset", "id_formal"]],
    hierarchy: Some(Hierarchy::Instance),
};

static VALUE_CAT: KindSpec = KindSpec {
    kind: K::ValueCat,
    table: "values_cat",
    key: KeySpec::Serial,
    fields: &[
        req("object", T::Uuid),
        req("desc_inst", T::Int),
        req("desc_cat", T::Int),
        opt("value_open", T::Text),
        opt("value_controlled", T::Int),
        opt("instance", T::Int),
    ],
    relations: &[
        fk(&["object"], K::Object, true),
        fk(&["desc_inst"], K::DescriptorInst, true),
        fk(&["desc_cat"], K::DescriptorCat, true),
        fk(&["value_controlled"], K::ControlledTerm, false),
        fk(&["instance"], K::ValueInst, false),
        RelationSpec {
            name: "obj_desc_inst",
            fields: &["object", "desc_inst"],
            target: K::ObjDescInst,
            required: true,
        },
        RelationSpec {
            name: "obj_desc_cat",
            fields: &["object", "desc_cat"],
            target: K::ObjDescCat,
            required: true,
        },
    ],
    unique: &[],
    hierarchy: None,
};

static VALUE_QUANT: KindSpec = KindSpec {
    kind: K::ValueQuant,
    table: "values_quant",
    key: KeySpec::Serial,
    fields: &[
        req("value", T::Number),
        req("object", T::Uuid),
        req("desc_inst", T::Int),
        req("desc_quant", T::Int),
        req("value_blob", T::Json),
        opt("instance", T::Int),
        opt("orig_value", T::Text),
        opt("orig_units", T::Text),
    ],
    relations: &[
        fk(&["object"], K::Object, true),
        fk(&["desc_inst"], K::DescriptorInst, true),
        fk(&["desc_quant"], K::DescriptorQuant, true),
        fk(&["instance"], K::ValueInst, false),
        RelationSpec {
            name: "obj_desc_inst",
            fields: &["object", "desc_inst"],
            target: K::ObjDescInst,
            required: true,
        },
        RelationSpec {
            name: "obj_desc_quant",
            fields: &["object", "desc_quant"],
            target: K::ObjDescQuant,
            required: true,
        },
    ],
    unique: &[],
    hierarchy: None,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relations_point_at_declared_columns() {
        for kind in EntityKind::ALL {
            let spec = kind.spec();
            assert_eq!(spec.kind, kind);
            for relation in spec.relations {
                assert!(!relation.fields.is_empty(), "{}.{} has no columns", kind, relation.name);
                assert_eq!(
                    relation.fields.len(),
                    relation.target.spec().key_columns().len(),
                    "{}.{} does not cover the target key",
                    kind,
                    relation.name
                );
                for field in relation.fields {
                    assert!(spec.field(field).is_some(), "{}.{} is not a column", kind, field);
                }
            }
        }
    }

    #[test]
    fn test_unique_sets_use_declared_columns() {
        for kind in EntityKind::ALL {
            let spec = kind.spec();
            for set in spec.unique {
                for column in *set {
                    assert!(spec.field(column).is_some(), "{}.{} is not a column", kind, column);
                }
            }
        }
    }

    #[test]
    fn test_hierarchies_are_declared_on_their_members() {
        for hierarchy in Hierarchy::ALL {
            assert_eq!(hierarchy.member().spec().hierarchy, Some(hierarchy));
        }
    }
}
