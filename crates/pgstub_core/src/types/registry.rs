//! Type registry.
//!
//! An explicit object owned by the schema (not a hidden global) so tests can
//! run independent registries side by side. Parameterized instances are
//! memoized: equal array types share one `Arc` for their element, and enum
//! types registered by DDL live here until dropped.

use std::sync::Arc;

use hashbrown::HashMap;
use pgstub_error::{DbError, ErrorKind, Result};

use super::datatype::{DataType, EnumType};

/// First oid handed out to user-defined types, matching the postgres
/// convention for non-builtin objects.
const FIRST_USER_OID: u32 = 16384;

#[derive(Debug)]
pub struct TypeRegistry {
    arrays: HashMap<DataType, DataType>,
    enums: HashMap<String, Arc<EnumType>>,
    next_oid: u32,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            arrays: HashMap::new(),
            enums: HashMap::new(),
            next_oid: FIRST_USER_OID,
        }
    }

    /// Memoized array-of-element type: equal element types share one arc.
    pub fn array_of(&mut self, elem: DataType) -> DataType {
        self.arrays
            .entry(elem.clone())
            .or_insert_with(|| DataType::Array(Arc::new(elem)))
            .clone()
    }

    pub fn text(&self, len: Option<u32>) -> DataType {
        DataType::Text(len)
    }

    /// Register a DDL-created enum type.
    pub fn register_enum(
        &mut self,
        name: impl Into<String>,
        labels: Vec<String>,
    ) -> Result<DataType> {
        let name = name.into();
        if self.enums.contains_key(&name) {
            return Err(DbError::with_kind(
                ErrorKind::Constraint,
                format!("type \"{name}\" already exists"),
            ));
        }
        let oid = self.next_oid;
        self.next_oid += 1;
        let e = Arc::new(EnumType {
            name: name.clone(),
            oid,
            labels,
        });
        self.enums.insert(name, e.clone());
        Ok(DataType::Enum(e))
    }

    pub fn drop_enum(&mut self, name: &str) -> Result<()> {
        self.enums
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| type_not_found(name))
    }

    /// Resolve a type by its SQL name. Understands the builtin names plus
    /// registered enums; a trailing `[]` makes an array type.
    pub fn type_by_name(&mut self, name: &str) -> Result<DataType> {
        let name = name.trim();
        if let Some(elem_name) = name.strip_suffix("[]") {
            let elem = self.type_by_name(elem_name)?;
            return Ok(self.array_of(elem));
        }

        let lower = name.to_ascii_lowercase();
        if let Some(rest) = lower
            .strip_prefix("varchar(")
            .or_else(|| lower.strip_prefix("character varying("))
        {
            let n: u32 = rest
                .strip_suffix(')')
                .and_then(|n| n.trim().parse().ok())
                .ok_or_else(|| type_not_found(name))?;
            return Ok(DataType::Text(Some(n)));
        }

        Ok(match lower.as_str() {
            "bool" | "boolean" => DataType::Bool,
            "int" | "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" => DataType::Int,
            "float" | "float4" | "float8" | "real" | "double precision" => DataType::Float,
            "text" | "citext" | "name" => DataType::TEXT,
            "varchar" | "character varying" => DataType::TEXT,
            "timestamp" | "timestamp without time zone" => DataType::Timestamp,
            "date" => DataType::Date,
            "uuid" => DataType::Uuid,
            "json" | "jsonb" => DataType::Json,
            _ => match self.enums.get(name) {
                Some(e) => DataType::Enum(e.clone()),
                None => return Err(type_not_found(name)),
            },
        })
    }

    /// Resolve a type by oid (result-metadata oids plus registered enums).
    pub fn type_by_oid(&self, oid: u32) -> Result<DataType> {
        let ty = match oid {
            16 => DataType::Bool,
            20 | 21 | 23 => DataType::Int,
            700 | 701 => DataType::Float,
            25 => DataType::TEXT,
            1043 => DataType::TEXT,
            1114 => DataType::Timestamp,
            1082 => DataType::Date,
            2950 => DataType::Uuid,
            114 | 3802 => DataType::Json,
            _ => {
                let e = self
                    .enums
                    .values()
                    .find(|e| e.oid == oid)
                    .ok_or_else(|| type_not_found(&format!("oid {oid}")))?;
                DataType::Enum(e.clone())
            }
        };
        Ok(ty)
    }
}

fn type_not_found(name: &str) -> DbError {
    DbError::with_kind(ErrorKind::NotFound, format!("type \"{name}\" does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_types_are_memoized() {
        let mut reg = TypeRegistry::new();
        let a = reg.array_of(DataType::Int);
        let b = reg.array_of(DataType::Int);
        let (DataType::Array(ea), DataType::Array(eb)) = (&a, &b) else {
            panic!("expected array types");
        };
        assert!(Arc::ptr_eq(ea, eb));
    }

    #[test]
    fn builtin_names() {
        let mut reg = TypeRegistry::new();
        assert_eq!(DataType::Int, reg.type_by_name("integer").unwrap());
        assert_eq!(DataType::Text(Some(12)), reg.type_by_name("varchar(12)").unwrap());
        assert_eq!(
            DataType::Array(Arc::new(DataType::Int)),
            reg.type_by_name("int[]").unwrap()
        );
        assert!(reg.type_by_name("mystery").is_err());
    }

    #[test]
    fn enum_register_drop() {
        let mut reg = TypeRegistry::new();
        let ty = reg
            .register_enum("mood", vec!["sad".to_string(), "happy".to_string()])
            .unwrap();
        let DataType::Enum(e) = &ty else {
            panic!("expected enum");
        };
        assert!(e.oid >= FIRST_USER_OID);
        assert_eq!(ty, reg.type_by_name("mood").unwrap());
        assert_eq!(ty, reg.type_by_oid(e.oid).unwrap());

        assert!(reg.register_enum("mood", vec![]).is_err());
        reg.drop_enum("mood").unwrap();
        assert!(reg.type_by_name("mood").is_err());
    }
}
