//! 过滤器模块
//! Filter module
//!
//! 历史查询的过滤器，以及把调用方权限切片编译成存储查询的编译器
//! The history-listing filter, and the compiler that turns the caller's
//! permission slice into a store query

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::permission::{ContextType, Permission, PermissionContext};
use crate::store::Document;
use crate::target::{KindType, OwnerType, TargetType};
use crate::FILTER_MAX_LIMIT;

/// 按目标类型（可选加目标值）限制可见范围
/// Restricts visibility by target type and optionally by target values
#[derive(Debug, Clone)]
pub struct TargetFilter {
  pub target_type: TargetType,
  pub values: Option<Vec<String>>,
}

/// 历史查询过滤器
/// History-listing filter
#[derive(Debug, Clone, Default)]
pub struct Filter {
  pub target_type: Option<TargetType>,
  pub target_value: Option<String>,
  pub kind_type: Option<KindType>,
  pub kind_name: Option<String>,
  pub owner_type: Option<OwnerType>,
  pub owner_name: Option<String>,
  pub since: Option<DateTime<Utc>>,
  pub until: Option<DateTime<Utc>>,
  pub running: Option<bool>,
  pub include_removed: bool,
  pub error_only: bool,
  /// 最后合并的原始子句，可以覆盖已有子句
  /// Raw clauses merged last, may override earlier ones
  pub raw: Option<Document>,
  pub allowed_targets: Option<Vec<TargetFilter>>,
  pub permissions: Option<Vec<Permission>>,

  pub limit: i64,
  pub skip: i64,
  pub sort: Option<String>,
}

impl Filter {
  /// 清洗来自用户输入的过滤器
  /// Sanitize a filter sourced from user input
  ///
  /// 清空 `raw`、`allowed_targets` 和 `permissions`，并把 `limit` 收敛到
  /// `[1, FILTER_MAX_LIMIT]`。
  /// Clears `raw`, `allowed_targets` and `permissions`, and clamps `limit`
  /// into `[1, FILTER_MAX_LIMIT]`.
  pub fn prune_user_values(&mut self) {
    self.raw = None;
    self.allowed_targets = None;
    self.permissions = None;
    if self.limit > FILTER_MAX_LIMIT || self.limit <= 0 {
      self.limit = FILTER_MAX_LIMIT;
    }
  }

  /// 编译为存储查询
  /// Compile into a store query
  ///
  /// `allowed_targets` 提供但为空时查询退化，调用方得到空结果而不是错误。
  /// A supplied-but-empty `allowed_targets` degenerates the query; callers get
  /// an empty result instead of an error.
  pub(crate) fn to_query(&self) -> Result<Value> {
    let mut query = Document::new();
    if let Some(permissions) = &self.permissions {
      let mut by_scheme: BTreeMap<&str, Vec<&PermissionContext>> = BTreeMap::new();
      for permission in permissions {
        by_scheme
          .entry(permission.scheme.full_name())
          .or_default()
          .push(&permission.context);
      }
      let mut perm_or = Vec::with_capacity(by_scheme.len());
      for (scheme, contexts) in by_scheme {
        let mut context_docs = Some(Vec::with_capacity(contexts.len()));
        for context in contexts {
          if context.ctx_type == ContextType::Global {
            context_docs = None;
            break;
          }
          if let Some(docs) = context_docs.as_mut() {
            docs.push(serde_json::to_value(context)?);
          }
        }
        let mut clause = json!({
          "allowed.scheme": {"$regex": format!("^{}", scheme.replace('.', "\\."))}
        });
        if let Some(docs) = context_docs {
          clause["allowed.contexts"] = json!({ "$in": docs });
        }
        perm_or.push(clause);
      }
      query.insert("$or".to_string(), Value::Array(perm_or));
    }
    if let Some(allowed_targets) = &self.allowed_targets {
      let mut or_block = Vec::with_capacity(allowed_targets.len());
      for at in allowed_targets {
        let mut clause = json!({"target.type": at.target_type});
        if let Some(values) = &at.values {
          clause["target.value"] = json!({ "$in": values });
        }
        or_block.push(clause);
      }
      if or_block.is_empty() {
        return Err(Error::InvalidQuery);
      }
      query.insert("$or".to_string(), Value::Array(or_block));
    }
    if let Some(target_type) = self.target_type {
      query.insert("target.type".to_string(), json!(target_type));
    }
    if let Some(target_value) = &self.target_value {
      query.insert("target.value".to_string(), json!(target_value));
    }
    if let Some(kind_type) = self.kind_type {
      query.insert("kind.type".to_string(), json!(kind_type));
    }
    if let Some(kind_name) = &self.kind_name {
      query.insert("kind.name".to_string(), json!(kind_name));
    }
    if let Some(owner_type) = self.owner_type {
      query.insert("owner.type".to_string(), json!(owner_type));
    }
    if let Some(owner_name) = &self.owner_name {
      query.insert("owner.name".to_string(), json!(owner_name));
    }
    let mut time_parts = Vec::new();
    if let Some(since) = self.since {
      time_parts.push(json!({"starttime": {"$gte": since.timestamp_millis()}}));
    }
    if let Some(until) = self.until {
      time_parts.push(json!({"starttime": {"$lte": until.timestamp_millis()}}));
    }
    if !time_parts.is_empty() {
      query.insert("$and".to_string(), Value::Array(time_parts));
    }
    if let Some(running) = self.running {
      query.insert("running".to_string(), json!(running));
    }
    if !self.include_removed {
      query.insert("removedate".to_string(), json!({"$exists": false}));
    }
    if self.error_only {
      query.insert("error".to_string(), json!({"$ne": ""}));
    }
    if let Some(raw) = &self.raw {
      for (key, value) in raw {
        query.insert(key.clone(), value.clone());
      }
    }
    Ok(Value::Object(query))
  }
}
