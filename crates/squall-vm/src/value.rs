//! Conversion of interpreter values into host values.
//!
//! Interpreter values are bound to the worker thread. Anything that has to
//! cross back to a caller is exported as `serde_json::Value` first.

use crate::error::{VmError, VmResult};
use crate::interpreter::exception_to_error;
use rquickjs::{Coerced, Ctx, FromJs, Value};

/// Export a value as JSON.
///
/// `undefined`, functions and symbols become `null`, matching what
/// `JSON.stringify` does for them inside arrays.
pub fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> VmResult<serde_json::Value> {
    if value.is_undefined() || value.is_function() || value.is_symbol() {
        return Ok(serde_json::Value::Null);
    }
    if value.as_big_int().is_some() {
        // JSON.stringify throws on BigInt; export the decimal text instead.
        return Ok(serde_json::Value::String(to_display_string(ctx, value)?));
    }

    let json = match ctx.json_stringify(value) {
        Ok(json) => json,
        // Circular structures and nested BigInts make JSON.stringify throw.
        Err(e) if e.is_exception() => return Err(exception_to_error(ctx, ctx.catch())),
        Err(e) => return Err(VmError::Engine(format!("failed to serialize value: {e}"))),
    };
    match json {
        Some(text) => {
            let text = text.to_string()?;
            serde_json::from_str(&text)
                .map_err(|e| VmError::internal(format!("invalid JSON from interpreter: {e}")))
        }
        None => Ok(serde_json::Value::Null),
    }
}

/// String form of a value, as `String(value)` would produce it.
pub fn to_display_string<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> VmResult<String> {
    Coerced::<String>::from_js(ctx, value)
        .map(|s| s.0)
        .map_err(VmError::from)
}

/// `typeof`-style name of a value, with `null` reported as `"null"`.
pub fn type_name(value: &Value<'_>) -> &'static str {
    if value.is_undefined() {
        "undefined"
    } else if value.is_null() {
        "null"
    } else if value.is_bool() {
        "boolean"
    } else if value.is_number() {
        "number"
    } else if value.is_string() {
        "string"
    } else if value.is_symbol() {
        "symbol"
    } else if value.as_big_int().is_some() {
        "bigint"
    } else if value.is_function() {
        "function"
    } else {
        "object"
    }
}
