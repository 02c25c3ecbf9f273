//! 自定义数据模块
//! Custom data module
//!
//! 事件自定义数据的入库门槛：只接受文档或数组形状的值，
//! 标量是调用方错误而不会被静默包装
//! Marshal gate for event custom data: only document- or array-shaped values are
//! accepted, scalars are a caller error rather than being silently wrapped

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// JSON 值的类型名，用于错误消息
/// Type name of a JSON value, used in error messages
fn value_type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

/// 校验并整理自定义数据
/// Validate and shape custom data
///
/// `None` 和 `null` 整理为缺省字段；文档和数组原样保留；其余形状返回校验错误。
/// `None` and `null` shape to an absent field; documents and arrays are kept
/// verbatim; any other shape returns a validation error.
pub(crate) fn marshal_custom_data(value: Option<&Value>) -> Result<Option<Value>> {
  match value {
    None | Some(Value::Null) => Ok(None),
    Some(v @ Value::Object(_)) | Some(v @ Value::Array(_)) => Ok(Some(v.clone())),
    Some(other) => Err(Error::InvalidCustomData(value_type_name(other))),
  }
}

/// 将表单键值映射转换为 `{name, value}` 文档列表
/// Convert a form key-to-values map into a list of `{name, value}` documents
///
/// 单元素的值列表被展平成标量。
/// A single-element value list is flattened to a scalar.
pub fn form_to_custom_data(form: &HashMap<String, Vec<String>>) -> Vec<Value> {
  let mut ret = Vec::with_capacity(form.len());
  for (name, values) in form {
    let value = if values.len() == 1 {
      json!(values[0])
    } else {
      json!(values)
    };
    ret.push(json!({"name": name, "value": value}));
  }
  ret
}
