//! 错误处理模块
//! Error handling module
//!
//! 定义了 evlock 库中使用的各种错误类型
//! Defines various error types used in the evlock library

use thiserror::Error;

use crate::event::EventData;
use crate::target::Target;
use crate::throttling::ThrottlingSpec;

/// evlock 库的结果类型
/// Result type for the evlock library
pub type Result<T> = std::result::Result<T, Error>;

/// evlock 错误类型
/// evlock error type
#[derive(Error, Debug)]
pub enum Error {
  /// 事件未找到错误
  /// Event not found error
  #[error("event not found")]
  EventNotFound,

  /// 事件不可取消错误
  /// Event not cancelable error
  #[error("event is not cancelable")]
  NotCancelable,

  /// 无效的事件目标类型
  /// Invalid event target type
  #[error("invalid event target type")]
  InvalidTargetType,

  /// 事件已被锁定，携带持有锁的事件
  /// Event is locked, carries the holding event
  #[error("event locked: {0}")]
  EventLocked(Box<EventData>),

  /// 事件被限流
  /// Event was throttled
  #[error(transparent)]
  Throttled(#[from] ThrottledError),

  /// 校验错误（调用方缺少必填字段）
  /// Validation error (caller missing a mandatory field)
  #[error("{0}")]
  Validation(&'static str),

  /// 事件被外部阻止注册表拒绝
  /// Event rejected by the external block registry
  #[error("event blocked: {0}")]
  Blocked(String),

  /// 主键冲突（目标已被锁定）
  /// Duplicate primary key (target already locked)
  #[error("duplicate key")]
  DuplicateId,

  /// 退化查询，内部使用，调用方收到空结果而非错误
  /// Degenerate query, internal; callers get an empty result instead of an error
  #[error("invalid query")]
  InvalidQuery,

  /// 自定义数据必须是文档或数组
  /// Custom data must be a document or an array
  #[error("cannot use type {0} as event custom data")]
  InvalidCustomData(&'static str),

  /// 序列化错误
  /// Serialization error
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// 存储错误
  /// Store error
  #[error("store error: {message}")]
  Store { message: String },
}

/// 限流错误，携带命中的限流规格和目标
/// Throttling error, carries the matched spec and the target
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottledError {
  pub spec: ThrottlingSpec,
  pub target: Target,
}

impl std::error::Error for ThrottledError {}

impl std::fmt::Display for ThrottledError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let extra = if self.spec.kind_name.is_empty() {
      String::new()
    } else {
      format!(" {} on", self.spec.kind_name)
    };
    write!(
      f,
      "event throttled, limit for{} {} {:?} is {} every {:?}",
      extra, self.target.target_type, self.target.value, self.spec.max, self.spec.time
    )
  }
}

impl Error {
  /// 创建存储错误
  /// Create a store error
  pub fn store<S: Into<String>>(message: S) -> Self {
    Self::Store {
      message: message.into(),
    }
  }

  pub fn no_target() -> Self {
    Self::Validation("event target is mandatory")
  }

  pub fn no_kind() -> Self {
    Self::Validation("event kind is mandatory")
  }

  pub fn no_owner() -> Self {
    Self::Validation("event owner is mandatory")
  }

  pub fn no_opts() -> Self {
    Self::Validation("event opts is mandatory")
  }

  pub fn no_internal_kind() -> Self {
    Self::Validation("event internal kind is mandatory")
  }

  pub fn no_allowed() -> Self {
    Self::Validation("event allowed is mandatory")
  }

  pub fn no_allowed_cancel() -> Self {
    Self::Validation("event allowed cancel is mandatory for cancelable events")
  }

  pub fn invalid_owner() -> Self {
    Self::Validation("event owner must not be set on internal events")
  }

  pub fn invalid_kind() -> Self {
    Self::Validation("event kind must not be set on internal events")
  }

  /// 检查是否为校验错误
  /// Check whether the error is a validation error
  pub fn is_validation(&self) -> bool {
    matches!(self, Error::Validation(_))
  }
}
