//! Heap numerics: bignums backing fixnum overflow, and boxed floats.
//!
//! Fixnums live entirely in the value word; any integer that does not fit
//! in 63 signed bits becomes a [`BignumObject`]. The arithmetic helpers
//! here perform the checked-fixnum fast path and fall back to bignum
//! allocation on overflow, normalizing back down whenever a result fits.

use crate::env::EnvRef;
use crate::exception::RResult;
use crate::global_env::GlobalEnv;
use crate::object::{alloc_cell, ObjectHeader};
use crate::object_type::ObjectType;
use crate::value_ext::ValueExt;
use garnet_core::value::{FIXNUM_MAX, FIXNUM_MIN};
use garnet_core::Value;
use num_bigint::BigInt;
use std::ptr::NonNull;

/// Arbitrary-precision integer payload. Class is `Integer`, same as
/// fixnums; the split is a storage detail.
#[repr(C)]
pub struct BignumObject {
    /// Shared header.
    pub header: ObjectHeader,
    value: BigInt,
}

/// Typed reference to a heap bignum.
#[derive(Clone, Copy)]
pub struct BignumRef(NonNull<BignumObject>);

impl BignumRef {
    /// Wrap a value already known to be a bignum.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Bignum));
        Self(NonNull::new(value.as_ptr() as *mut BignumObject).expect("non-null bignum"))
    }

    /// The arbitrary-precision value.
    pub fn value(&self) -> &BigInt {
        unsafe { &self.0.as_ref().value }
    }

    /// Duplicate into a fresh bignum cell.
    pub fn duplicate(&self) -> Value {
        from_bigint(self.value().clone())
    }
}

/// Boxed double payload.
#[repr(C)]
pub struct FloatObject {
    /// Shared header.
    pub header: ObjectHeader,
    value: f64,
}

/// Typed reference to a heap float.
#[derive(Clone, Copy)]
pub struct FloatRef(NonNull<FloatObject>);

impl FloatObject {
    /// Allocate a float of `Float` class.
    pub fn create(value: f64) -> Value {
        let ptr = alloc_cell(FloatObject {
            header: ObjectHeader::new(ObjectType::Float, GlobalEnv::the().float_class()),
            value,
        });
        Value::from_ptr(ptr.as_ptr() as *const ())
    }
}

impl FloatRef {
    /// Wrap a value already known to be a heap float.
    pub fn from_value(value: Value) -> Self {
        debug_assert_eq!(value.heap_type(), Some(ObjectType::Float));
        Self(NonNull::new(value.as_ptr() as *mut FloatObject).expect("non-null float"))
    }

    /// The double.
    pub fn value(&self) -> f64 {
        unsafe { self.0.as_ref().value }
    }
}

/// Build an integer value: fixnum when it fits, bignum otherwise.
pub fn integer(i: i128) -> Value {
    if let Ok(small) = i64::try_from(i) {
        if let Some(fixnum) = Value::fixnum(small) {
            return fixnum;
        }
    }
    from_bigint(BigInt::from(i))
}

/// Build an integer value from a `BigInt`, normalizing to a fixnum when it
/// fits.
pub fn from_bigint(big: BigInt) -> Value {
    if let Some(small) = to_fixnum_range(&big) {
        if let Some(fixnum) = Value::fixnum(small) {
            return fixnum;
        }
    }
    let ptr = alloc_cell(BignumObject {
        header: ObjectHeader::new(ObjectType::Bignum, GlobalEnv::the().integer_class()),
        value: big,
    });
    Value::from_ptr(ptr.as_ptr() as *const ())
}

fn to_fixnum_range(big: &BigInt) -> Option<i64> {
    let small: i64 = big.try_into().ok()?;
    (FIXNUM_MIN..=FIXNUM_MAX).contains(&small).then_some(small)
}

/// Is the value an integer (fixnum or bignum)?
pub fn is_integer(value: Value) -> bool {
    value.is_fixnum() || value.heap_type() == Some(ObjectType::Bignum)
}

fn to_bigint(env: EnvRef, value: Value) -> RResult<BigInt> {
    if let Some(i) = value.to_fixnum() {
        return Ok(BigInt::from(i));
    }
    if value.heap_type() == Some(ObjectType::Bignum) {
        return Ok(BignumRef::from_value(value).value().clone());
    }
    Err(env.raise(
        "TypeError",
        format!("{} can't be coerced into Integer", value.class_name()),
    ))
}

/// Integer addition with fixnum fast path and bignum fallback.
pub fn add(env: EnvRef, a: Value, b: Value) -> RResult {
    if let (Some(x), Some(y)) = (a.to_fixnum(), b.to_fixnum()) {
        // i64 addition of two 63-bit values cannot overflow i64; the
        // fixnum-range check decides the representation.
        return Ok(integer(x as i128 + y as i128));
    }
    Ok(from_bigint(to_bigint(env, a)? + to_bigint(env, b)?))
}

/// Integer subtraction.
pub fn sub(env: EnvRef, a: Value, b: Value) -> RResult {
    if let (Some(x), Some(y)) = (a.to_fixnum(), b.to_fixnum()) {
        return Ok(integer(x as i128 - y as i128));
    }
    Ok(from_bigint(to_bigint(env, a)? - to_bigint(env, b)?))
}

/// Integer multiplication.
pub fn mul(env: EnvRef, a: Value, b: Value) -> RResult {
    if let (Some(x), Some(y)) = (a.to_fixnum(), b.to_fixnum()) {
        return Ok(integer(x as i128 * y as i128));
    }
    Ok(from_bigint(to_bigint(env, a)? * to_bigint(env, b)?))
}

/// Floored integer division. Division by zero raises `ZeroDivisionError`.
pub fn div(env: EnvRef, a: Value, b: Value) -> RResult {
    let divisor = to_bigint(env, b)?;
    if divisor == BigInt::from(0) {
        return Err(env.raise("ZeroDivisionError", "divided by 0"));
    }
    let dividend = to_bigint(env, a)?;
    // Ruby floors toward negative infinity; BigInt truncates toward zero.
    let quotient = &dividend / &divisor;
    let remainder = &dividend - &quotient * &divisor;
    let needs_floor = remainder != BigInt::from(0)
        && (remainder < BigInt::from(0)) != (divisor < BigInt::from(0));
    Ok(from_bigint(if needs_floor {
        quotient - 1
    } else {
        quotient
    }))
}

/// Structural equality across fixnum/bignum representations.
pub fn eq(a: Value, b: Value) -> bool {
    match (a.to_fixnum(), b.to_fixnum()) {
        (Some(x), Some(y)) => x == y,
        _ => {
            let big_a = match a.heap_type() {
                Some(ObjectType::Bignum) => Some(BignumRef::from_value(a).value().clone()),
                _ => a.to_fixnum().map(BigInt::from),
            };
            let big_b = match b.heap_type() {
                Some(ObjectType::Bignum) => Some(BignumRef::from_value(b).value().clone()),
                _ => b.to_fixnum().map(BigInt::from),
            };
            matches!((big_a, big_b), (Some(x), Some(y)) if x == y)
        }
    }
}
