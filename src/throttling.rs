//! 限流模块
//! Throttling module
//!
//! 按目标类型（可选再按种类名）对事件创建施加滑动窗口速率限制
//! Applies sliding-window rate limits to event creation, keyed by target type
//! and optionally by kind name

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::target::{Kind, Target, TargetType};

/// 限流规格
/// Throttling spec
///
/// `max <= 0` 或窗口为零的规格不生效。
/// A spec with `max <= 0` or a zero window is inactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlingSpec {
  pub target_type: TargetType,
  /// 为空时适用于该目标类型的所有种类
  /// Applies to every kind of the target type when empty
  pub kind_name: String,
  pub max: i64,
  pub time: Duration,
}

impl ThrottlingSpec {
  /// 注册表键：`"<type>"` 或 `"<type>_<kind>"`
  /// Registry key: `"<type>"` or `"<type>_<kind>"`
  fn registry_key(&self) -> String {
    if self.kind_name.is_empty() {
      self.target_type.as_str().to_string()
    } else {
      format!("{}_{}", self.target_type, self.kind_name)
    }
  }

  pub(crate) fn is_active(&self) -> bool {
    self.max > 0 && !self.time.is_zero()
  }
}

/// 进程范围的限流表；查找优先匹配种类键，回退到目标类型键
/// Process-wide throttling table; lookup prefers the kind-specific key and
/// falls back to the target-type-only key
#[derive(Default)]
pub(crate) struct ThrottlingRegistry {
  specs: RwLock<HashMap<String, ThrottlingSpec>>,
}

impl ThrottlingRegistry {
  pub fn set(&self, spec: ThrottlingSpec) {
    let mut specs = self.specs.write().unwrap_or_else(|err| err.into_inner());
    specs.insert(spec.registry_key(), spec);
  }

  pub fn get(&self, target: &Target, kind: &Kind) -> Option<ThrottlingSpec> {
    let specs = self.specs.read().unwrap_or_else(|err| err.into_inner());
    let kind_key = format!("{}_{}", target.target_type, kind.name);
    if let Some(spec) = specs.get(&kind_key) {
      return Some(spec.clone());
    }
    specs.get(target.target_type.as_str()).cloned()
  }
}
