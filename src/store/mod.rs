//! 存储模块
//! Store module
//!
//! 定义了与事件集合交互的抽象层；唯一的写原语是按主键条件插入，
//! 互斥正是建立在这个原语之上
//! Defines the abstraction layer for interacting with the events collection; the
//! only write primitive is a conditional insert keyed by primary key, which is
//! what mutual exclusion is built on

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub mod memory;

pub use memory::MemoryStore;

/// 事件集合中的一行，字段名遵循持久化模式
/// One row of the events collection, field names follow the persistence schema
pub type Document = serde_json::Map<String, Value>;

/// 查询选项
/// Find options
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
  /// 排序字段，`-` 前缀表示降序
  /// Sort field, a `-` prefix means descending
  pub sort: Option<String>,
  /// 结果上限；`<= 0` 表示不限制
  /// Result cap; `<= 0` means unlimited
  pub limit: i64,
  /// 跳过的行数
  /// Rows to skip
  pub skip: i64,
}

/// 事件集合句柄；实现必须保证 `_id` 上的唯一性
/// Events collection handle; implementations must enforce uniqueness on `_id`
///
/// 查询语言是编译器产出的 Mongo 风格文档子集：`$or`、`$and`、相等、
/// `$ne`、`$gt`/`$gte`/`$lte`、`$in`、`$exists`、`$regex`。
/// The query language is the Mongo-style document subset the compiler emits:
/// `$or`, `$and`, equality, `$ne`, `$gt`/`$gte`/`$lte`, `$in`, `$exists`,
/// `$regex`.
#[async_trait]
pub trait EventStore: Send + Sync {
  /// 插入一行；`_id` 已存在时返回 [`Error::DuplicateId`](crate::Error::DuplicateId)
  /// Insert a row; returns [`Error::DuplicateId`](crate::Error::DuplicateId)
  /// when the `_id` already exists
  async fn insert(&self, doc: Document) -> Result<()>;

  /// 返回第一条匹配的行
  /// Return the first matching row
  async fn find_one(&self, query: &Value) -> Result<Option<Document>>;

  /// 返回所有匹配的行，应用排序、跳过和上限
  /// Return all matching rows, applying sort, skip and limit
  async fn find(&self, query: &Value, options: &FindOptions) -> Result<Vec<Document>>;

  /// 统计匹配的行数
  /// Count matching rows
  async fn count(&self, query: &Value) -> Result<u64>;

  /// 按 `_id` 应用 `$set` 更新；缺失时返回 [`Error::EventNotFound`](crate::Error::EventNotFound)
  /// Apply a `$set` update by `_id`; returns
  /// [`Error::EventNotFound`](crate::Error::EventNotFound) when missing
  async fn update_by_id(&self, id: &Value, update: &Value) -> Result<()>;

  /// 按 `_id` 整行替换
  /// Replace a whole row by `_id`
  async fn replace_by_id(&self, id: &Value, doc: Document) -> Result<()>;

  /// 对所有匹配的行应用 `$set` 更新，返回修改的行数
  /// Apply a `$set` update to all matching rows, returns the modified count
  async fn update_many(&self, query: &Value, update: &Value) -> Result<u64>;

  /// 原子地找到第一条匹配的行并应用 `$set` 更新，返回更新后的行
  /// Atomically find the first matching row and apply a `$set` update,
  /// returning the new row
  async fn find_one_and_update(&self, query: &Value, update: &Value) -> Result<Option<Document>>;

  /// 按 `_id` 删除
  /// Delete by `_id`
  async fn delete_by_id(&self, id: &Value) -> Result<()>;

  /// 匹配行中某字段的去重取值
  /// Distinct values of a field across matching rows
  async fn distinct(&self, key: &str, query: &Value) -> Result<Vec<Value>>;
}
