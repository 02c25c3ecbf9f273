//! 目标模块
//! Target module
//!
//! 定义了事件作用的资源（目标）、发起者（所有者）和动作类别（种类）的类型化标识符
//! Defines typed identifiers for the resource acted on (target), the actor (owner)
//! and the action category (kind) of an event

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 事件目标的资源类型
/// Resource type of an event target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
  App,
  Node,
  Container,
  Pool,
  Service,
  ServiceInstance,
  Team,
  User,
  Iaas,
  Role,
  Platform,
  Plan,
  NodeContainer,
  InstallHost,
  EventBlock,
}

impl TargetType {
  /// 将目标类型转换为字符串
  /// Convert the target type to a string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::App => "app",
      Self::Node => "node",
      Self::Container => "container",
      Self::Pool => "pool",
      Self::Service => "service",
      Self::ServiceInstance => "service-instance",
      Self::Team => "team",
      Self::User => "user",
      Self::Iaas => "iaas",
      Self::Role => "role",
      Self::Platform => "platform",
      Self::Plan => "plan",
      Self::NodeContainer => "node-container",
      Self::InstallHost => "install-host",
      Self::EventBlock => "event-block",
    }
  }
}

impl FromStr for TargetType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "app" => Ok(Self::App),
      "node" => Ok(Self::Node),
      "container" => Ok(Self::Container),
      "pool" => Ok(Self::Pool),
      "service" => Ok(Self::Service),
      "service-instance" => Ok(Self::ServiceInstance),
      "team" => Ok(Self::Team),
      "user" => Ok(Self::User),
      "iaas" => Ok(Self::Iaas),
      "role" => Ok(Self::Role),
      "platform" => Ok(Self::Platform),
      "plan" => Ok(Self::Plan),
      "node-container" => Ok(Self::NodeContainer),
      "install-host" => Ok(Self::InstallHost),
      "event-block" => Ok(Self::EventBlock),
      _ => Err(Error::InvalidTargetType),
    }
  }
}

impl fmt::Display for TargetType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 事件作用的资源，由类型和值组成
/// The resource acted on by an event, a (type, value) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
  #[serde(rename = "type")]
  pub target_type: TargetType,
  pub value: String,
}

impl Target {
  pub fn new<S: Into<String>>(target_type: TargetType, value: S) -> Self {
    Self {
      target_type,
      value: value.into(),
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.target_type, self.value)
  }
}

/// 事件所有者类型
/// Event owner type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
  User,
  App,
  Internal,
}

impl OwnerType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::User => "user",
      Self::App => "app",
      Self::Internal => "internal",
    }
  }
}

impl fmt::Display for OwnerType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 发起事件的主体；内部事件的名称为空
/// The actor that began the event; internal events have an empty name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
  #[serde(rename = "type")]
  pub owner_type: OwnerType,
  pub name: String,
}

impl Owner {
  pub fn new<S: Into<String>>(owner_type: OwnerType, name: S) -> Self {
    Self {
      owner_type,
      name: name.into(),
    }
  }

  /// 内部所有者，用于没有认证主体的事件
  /// Internal owner, used by events without an auth principal
  pub fn internal() -> Self {
    Self {
      owner_type: OwnerType::Internal,
      name: String::new(),
    }
  }
}

impl fmt::Display for Owner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.owner_type, self.name)
  }
}

/// 事件种类类型
/// Event kind type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindType {
  Permission,
  Internal,
}

impl KindType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Permission => "permission",
      Self::Internal => "internal",
    }
  }
}

/// 事件的动作类别；权限种类存放完整的权限方案名，内部种类存放自由字符串
/// The action category of an event; permission kinds hold the fully qualified
/// permission-scheme name, internal kinds hold a free string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kind {
  #[serde(rename = "type")]
  pub kind_type: KindType,
  pub name: String,
}

impl Kind {
  pub fn permission<S: Into<String>>(name: S) -> Self {
    Self {
      kind_type: KindType::Permission,
      name: name.into(),
    }
  }

  pub fn internal<S: Into<String>>(name: S) -> Self {
    Self {
      kind_type: KindType::Internal,
      name: name.into(),
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// 认证主体接入点；所有者由它派生
/// Auth principal seam; owners are derived from it
///
/// 应用范围的令牌产生 `(app, app_name)`，用户范围的令牌产生 `(user, user_name)`。
/// An app-scoped token yields `(app, app_name)`, a user-scoped token yields
/// `(user, user_name)`.
pub trait AuthToken: Send + Sync {
  /// 令牌是否为应用范围
  /// Whether the token is app-scoped
  fn is_app_token(&self) -> bool;

  /// 应用名（应用范围令牌）
  /// Application name (app-scoped tokens)
  fn app_name(&self) -> String;

  /// 用户名（用户范围令牌）
  /// User name (user-scoped tokens)
  fn user_name(&self) -> String;
}
