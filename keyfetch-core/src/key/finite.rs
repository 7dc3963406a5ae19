//! Rejects non-finite floats before parameters reach `serde_json::Value`.
//!
//! serde_json writes NaN and the infinities as `null`, which would give
//! `{"lat": NaN}` and `{"lat": null}` the same cache key. This serializer
//! walks the parameter value without producing anything and fails on the
//! first float that has no JSON representation.

use std::fmt;

use serde::ser::{self, Serialize};

#[derive(Debug)]
pub(super) struct NonFinite(String);

impl fmt::Display for NonFinite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NonFinite {}

impl ser::Error for NonFinite {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Fail if `value` contains a NaN or infinite float anywhere.
pub(super) fn check<T: Serialize + ?Sized>(value: &T) -> Result<(), NonFinite> {
    value.serialize(FiniteCheck)
}

fn float(v: f64) -> Result<(), NonFinite> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(NonFinite(format!("non-finite float {v} has no JSON form")))
    }
}

#[derive(Clone, Copy)]
struct FiniteCheck;

impl ser::Serializer for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i16(self, _: i16) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i32(self, _: i32) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i64(self, _: i64) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_i128(self, _: i128) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u8(self, _: u8) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u16(self, _: u16) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u32(self, _: u32) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u64(self, _: u64) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_u128(self, _: u128) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_f32(self, v: f32) -> Result<(), NonFinite> {
        float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<(), NonFinite> {
        float(v)
    }

    fn serialize_char(self, _: char) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_str(self, _: &str) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_bytes(self, _: &[u8]) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), NonFinite> {
        key.serialize(*self)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(serde::Serialize)]
    enum Shape {
        Circle { radius: f32 },
        Point(f64, f64),
    }

    #[test]
    fn test_finite_values_pass() {
        assert!(check(&(1.5f64, -0.0f32, "x", Some(3u8))).is_ok());
        assert!(check(&Shape::Circle { radius: 2.0 }).is_ok());
    }

    #[test]
    fn test_nested_non_finite_fails() {
        assert!(check(&vec![Some(1.0), Some(f64::NAN)]).is_err());
        assert!(check(&Shape::Point(0.0, f64::NEG_INFINITY)).is_err());
        assert!(check(&Shape::Circle { radius: f32::INFINITY }).is_err());

        let mut map = BTreeMap::new();
        map.insert("lat", f64::NAN);
        let err = check(&map).unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }
}
