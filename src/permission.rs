//! 权限模块
//! Permission module
//!
//! 定义了附加到每个事件上的授权向量（权限方案 + 作用域上下文），
//! 以及查询编译所需的权限模型
//! Defines the authorization vector attached to every event (permission scheme +
//! scoping contexts) and the permission model the query compiler consumes

use serde::{Deserialize, Serialize};
use std::fmt;

/// 权限上下文类型
/// Permission context type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
  /// 全局上下文，使该方案对所有读者可见
  /// Global context, makes the scheme visible to every reader
  Global,
  App,
  Team,
  User,
  Pool,
  Service,
  ServiceInstance,
  Iaas,
}

impl ContextType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Global => "global",
      Self::App => "app",
      Self::Team => "team",
      Self::User => "user",
      Self::Pool => "pool",
      Self::Service => "service",
      Self::ServiceInstance => "service-instance",
      Self::Iaas => "iaas",
    }
  }
}

impl fmt::Display for ContextType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 单个作用域上下文，(类型, 值) 对
/// A single scoping context, a (type, value) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionContext {
  #[serde(rename = "ctxtype")]
  pub ctx_type: ContextType,
  pub value: String,
}

impl PermissionContext {
  pub fn new<S: Into<String>>(ctx_type: ContextType, value: S) -> Self {
    Self {
      ctx_type,
      value: value.into(),
    }
  }

  /// 全局上下文
  /// The global context
  pub fn global() -> Self {
    Self {
      ctx_type: ContextType::Global,
      value: String::new(),
    }
  }
}

/// 带点命名空间的权限方案，例如 `app.deploy`
/// Dotted-namespace permission scheme, e.g. `app.deploy`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionScheme {
  name: String,
}

impl PermissionScheme {
  pub fn new<S: Into<String>>(name: S) -> Self {
    Self { name: name.into() }
  }

  /// 完整的方案名
  /// The fully qualified scheme name
  pub fn full_name(&self) -> &str {
    &self.name
  }
}

impl fmt::Display for PermissionScheme {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// 调用方持有的一条权限：方案 + 上下文
/// One permission held by a caller: scheme + context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
  pub scheme: PermissionScheme,
  pub context: PermissionContext,
}

impl Permission {
  pub fn new(scheme: PermissionScheme, context: PermissionContext) -> Self {
    Self { scheme, context }
  }
}

/// 事件创建时附加的授权向量
/// The authorization vector attached at event creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedPermission {
  #[serde(default)]
  pub scheme: String,
  #[serde(default)]
  pub contexts: Vec<PermissionContext>,
}

impl AllowedPermission {
  pub fn new(scheme: &PermissionScheme, contexts: Vec<PermissionContext>) -> Self {
    Self {
      scheme: scheme.full_name().to_string(),
      contexts,
    }
  }

  /// 方案和上下文都为空时向量无效
  /// The vector is empty when both scheme and contexts are missing
  pub fn is_empty(&self) -> bool {
    self.scheme.is_empty() && self.contexts.is_empty()
  }
}
