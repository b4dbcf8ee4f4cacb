use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    I1,
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
    /// Opaque pointer. Loads, stores and element-address computations carry
    /// the pointee type themselves.
    Ptr,
    Array(Box<Ty>, u64),
    Struct {
        fields: Vec<Ty>,
        packed: bool,
        name: Option<String>,
    },
    Void,
}

impl Ty {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Ty::I1 | Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64 | Ty::I128
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::F32 | Ty::F64)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Ty::Ptr)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Ty::Array(..) | Ty::Struct { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Ty::Void)
    }

    pub fn int_width(&self) -> Option<u32> {
        match self {
            Ty::I1 => Some(1),
            Ty::I8 => Some(8),
            Ty::I16 => Some(16),
            Ty::I32 => Some(32),
            Ty::I64 => Some(64),
            Ty::I128 => Some(128),
            _ => None,
        }
    }

    pub fn array(element: Ty, len: u64) -> Ty {
        Ty::Array(Box::new(element), len)
    }

    pub fn anonymous_struct(fields: Vec<Ty>) -> Ty {
        Ty::Struct {
            fields,
            packed: false,
            name: None,
        }
    }
}
