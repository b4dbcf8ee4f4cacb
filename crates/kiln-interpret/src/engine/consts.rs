use std::sync::Arc;

use kiln_core::ir::{ConstValue, GlobalId, Program, Ty};

use crate::engine::value::{ApInt, Value};
use crate::engine::Interpreter;
use crate::error::EvalError;

impl Interpreter {
    /// Materialize a named global into the globals segment, memoized by its
    /// stable id: the same global yields the same address for the lifetime of
    /// the engine's constant cache (structural sharing, not duplication).
    pub(crate) fn materialize_global(
        &mut self,
        program: &Program,
        id: GlobalId,
    ) -> Result<u64, EvalError> {
        if let Some(address) = self.const_addrs.get(&id) {
            return Ok(*address);
        }
        let global = program
            .global(id)
            .ok_or_else(|| EvalError::Malformed(format!("unknown global @g{}", id)))?;
        // A global without an initializer has no layout; hand back the null
        // address instead of failing.
        let Some(init) = global.init.clone() else {
            return Ok(0);
        };
        let size = self.oracle.size_of(&global.ty);
        let address = self.memory.alloc_globals(size)?;
        self.const_addrs.insert(id, address);
        tracing::debug!("materialized @g{} ({}) at {:#x}", id, global.name, address);
        self.copy_const_into(program, &init, address)?;
        Ok(address)
    }

    /// Materialize an arbitrary constant into the globals segment and return
    /// its address. Global references go through the identity cache.
    pub(crate) fn materialize_const(
        &mut self,
        program: &Program,
        constant: &ConstValue,
    ) -> Result<u64, EvalError> {
        match constant {
            ConstValue::GlobalRef(id) => self.materialize_global(program, *id),
            ConstValue::FunctionRef(_) => Err(EvalError::FunctionPointerUnsupported),
            _ => {
                let size = self.oracle.size_of(&constant.ty());
                let address = self.memory.alloc_globals(size)?;
                self.copy_const_into(program, constant, address)?;
                Ok(address)
            }
        }
    }

    fn copy_const_into(
        &mut self,
        program: &Program,
        constant: &ConstValue,
        address: u64,
    ) -> Result<(), EvalError> {
        let oracle = Arc::clone(&self.oracle);
        let big_endian = oracle.is_big_endian();
        match constant {
            ConstValue::Int(v, ty) => {
                let width = ty
                    .int_width()
                    .ok_or_else(|| EvalError::Malformed(format!("non-integer type {} on integer constant", ty)))?;
                let size = oracle.size_of(ty) as usize;
                let bytes = ApInt::from_i128(width, *v).to_bytes(size, big_endian);
                self.memory.write_bytes(address, &bytes)
            }
            ConstValue::Bool(b) => self.memory.write_bytes(address, &[u8::from(*b)]),
            ConstValue::F32(v) => {
                let bits = ApInt::new(32, u128::from(v.to_bits()));
                self.memory.write_bytes(address, &bits.to_bytes(4, big_endian))
            }
            ConstValue::F64(v) => {
                let bits = ApInt::new(64, u128::from(v.to_bits()));
                self.memory.write_bytes(address, &bits.to_bytes(8, big_endian))
            }
            ConstValue::Str(s) => self.memory.write_bytes(address, s.as_bytes()),
            ConstValue::Array(elements, elem_ty) => {
                let stride = oracle.size_of(elem_ty);
                for (i, element) in elements.iter().enumerate() {
                    self.copy_const_into(program, element, address + i as u64 * stride)?;
                }
                Ok(())
            }
            ConstValue::Struct(fields, ty) => {
                let layout = oracle
                    .struct_layout(ty)
                    .ok_or_else(|| EvalError::Malformed(format!("no layout for type {}", ty)))?;
                for (field, offset) in fields.iter().zip(layout.field_offsets.iter()) {
                    self.copy_const_into(program, field, address + offset)?;
                }
                Ok(())
            }
            ConstValue::GlobalRef(id) => {
                let target = self.materialize_global(program, *id)?;
                let width = oracle.pointer_width();
                let bytes =
                    ApInt::new(width, u128::from(target)).to_bytes((width / 8) as usize, big_endian);
                self.memory.write_bytes(address, &bytes)
            }
            ConstValue::NullPtr => {
                let size = u64::from(oracle.pointer_width() / 8);
                let zeros = vec![0u8; size as usize];
                self.memory.write_bytes(address, &zeros)
            }
            ConstValue::FunctionRef(_) => Err(EvalError::FunctionPointerUnsupported),
            ConstValue::Undef(ty) => {
                let zeros = vec![0u8; oracle.size_of(ty) as usize];
                self.memory.write_bytes(address, &zeros)
            }
        }
    }

    /// Turn an immediate constant into a runtime value.
    pub(crate) fn const_to_value(
        &mut self,
        program: &Program,
        constant: &ConstValue,
    ) -> Result<Value, EvalError> {
        let pointer_bits = self.pointer_bits();
        match constant {
            ConstValue::Int(v, ty) => {
                let width = ty.int_width().ok_or_else(|| {
                    EvalError::Malformed(format!("non-integer type {} on integer constant", ty))
                })?;
                Ok(Value::Int(ApInt::from_i128(width, *v)))
            }
            ConstValue::Bool(b) => Ok(Value::bool(*b)),
            ConstValue::F32(v) => Ok(Value::F32(*v)),
            ConstValue::F64(v) => Ok(Value::F64(*v)),
            ConstValue::Str(s) => Ok(Value::Aggregate(
                s.as_bytes()
                    .iter()
                    .map(|b| Value::int(8, u128::from(*b)))
                    .collect(),
            )),
            ConstValue::Array(elements, _) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.const_to_value(program, element)?);
                }
                Ok(Value::Aggregate(values))
            }
            ConstValue::Struct(fields, _) => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.const_to_value(program, field)?);
                }
                Ok(Value::Aggregate(values))
            }
            ConstValue::GlobalRef(id) => {
                let address = self.materialize_global(program, *id)?;
                Ok(Value::int(pointer_bits, u128::from(address)))
            }
            ConstValue::NullPtr => Ok(Value::int(pointer_bits, 0)),
            ConstValue::FunctionRef(_) => Err(EvalError::FunctionPointerUnsupported),
            ConstValue::Undef(ty) => Ok(Value::zero_of(ty, pointer_bits)),
        }
    }

    /// Rebuild a constant from evaluated memory; the structural inverse of
    /// [`Interpreter::copy_const_into`], used to reconstruct struct-return
    /// results.
    pub(crate) fn read_const_from_memory(
        &self,
        ty: &Ty,
        address: u64,
    ) -> Result<ConstValue, EvalError> {
        let big_endian = self.oracle.is_big_endian();
        match ty {
            Ty::I1 => {
                let bytes = self.memory.bytes(address, 1)?;
                Ok(ConstValue::Bool(bytes[0] != 0))
            }
            _ if ty.is_integer() => {
                let width = ty.int_width().expect("integer type has a width");
                let size = self.oracle.size_of(ty);
                let bytes = self.memory.bytes(address, size)?;
                let value = ApInt::from_bytes(width, bytes, big_endian);
                Ok(ConstValue::Int(value.as_i128(), ty.clone()))
            }
            Ty::F32 => {
                let bytes = self.memory.bytes(address, 4)?;
                let bits = ApInt::from_bytes(32, bytes, big_endian);
                Ok(ConstValue::F32(f32::from_bits(bits.as_u64() as u32)))
            }
            Ty::F64 => {
                let bytes = self.memory.bytes(address, 8)?;
                let bits = ApInt::from_bytes(64, bytes, big_endian);
                Ok(ConstValue::F64(f64::from_bits(bits.as_u64())))
            }
            Ty::Array(elem, len) => {
                let stride = self.oracle.size_of(elem);
                let mut elements = Vec::with_capacity(*len as usize);
                for i in 0..*len {
                    elements.push(self.read_const_from_memory(elem, address + i * stride)?);
                }
                Ok(ConstValue::Array(elements, (**elem).clone()))
            }
            Ty::Struct { fields, .. } => {
                let layout = self
                    .oracle
                    .struct_layout(ty)
                    .ok_or_else(|| EvalError::Malformed(format!("no layout for type {}", ty)))?;
                let mut values = Vec::with_capacity(fields.len());
                for (field, offset) in fields.iter().zip(layout.field_offsets.iter()) {
                    values.push(self.read_const_from_memory(field, address + offset)?);
                }
                Ok(ConstValue::Struct(values, ty.clone()))
            }
            Ty::Ptr => Err(EvalError::PointerReturnUnsupported),
            _ => Err(EvalError::Malformed(format!(
                "cannot rebuild a constant of type {}",
                ty
            ))),
        }
    }

    /// Express a scalar or by-value aggregate result back in the constant
    /// representation.
    pub(crate) fn value_to_const(&self, value: &Value, ty: &Ty) -> Result<ConstValue, EvalError> {
        match (value, ty) {
            (Value::Int(v), Ty::I1) => Ok(ConstValue::Bool(v.as_bool())),
            (Value::Int(v), _) if ty.is_integer() => Ok(ConstValue::Int(v.as_i128(), ty.clone())),
            (Value::F32(v), Ty::F32) => Ok(ConstValue::F32(*v)),
            (Value::F64(v), Ty::F64) => Ok(ConstValue::F64(*v)),
            (_, Ty::Ptr) => Err(EvalError::PointerReturnUnsupported),
            (Value::Aggregate(elements), Ty::Array(elem, len)) => {
                if elements.len() != *len as usize {
                    return Err(EvalError::Malformed(format!(
                        "aggregate arity mismatch rebuilding {}",
                        ty
                    )));
                }
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.value_to_const(element, elem)?);
                }
                Ok(ConstValue::Array(values, (**elem).clone()))
            }
            (Value::Aggregate(elements), Ty::Struct { fields, .. }) => {
                if elements.len() != fields.len() {
                    return Err(EvalError::Malformed(format!(
                        "aggregate arity mismatch rebuilding {}",
                        ty
                    )));
                }
                let mut values = Vec::with_capacity(elements.len());
                for (element, field) in elements.iter().zip(fields) {
                    values.push(self.value_to_const(element, field)?);
                }
                Ok(ConstValue::Struct(values, ty.clone()))
            }
            _ => Err(EvalError::Malformed(format!(
                "result value does not match declared type {}",
                ty
            ))),
        }
    }
}
