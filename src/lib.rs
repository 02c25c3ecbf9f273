//! # Evlock
//!
//! Auditable event and mutual-exclusion subsystem for multi-tenant platforms
//!
//! Evlock 记录对平台资源的每一次意图变更，同时阻止同一目标上的并发冲突变更。
//! Evlock records every intended mutation of a platform resource while
//! preventing concurrent conflicting mutations on the same target.
//! 它是建立在文档存储之上的分布式锁管理器，存储只需提供按主键的条件插入。
//! It is a distributed lock manager layered on a document store whose only
//! required primitive is a conditional insert keyed by primary key.
//!
//! ## 特性
//! ## Features
//!
//! - 事件持久化审计，附带授权向量
//!   - Durable event auditing with an authorization vector per record
//! - 按目标互斥，崩溃的持有者由锁过期回收
//!   - Per-target mutual exclusion, crashed holders reclaimed via lock expiry
//! - 后台心跳证明持有者存活
//!   - Background heartbeats proving holder liveness
//! - 两阶段协作取消（请求、应答）
//!   - Two-phase cooperative cancellation (ask, ack)
//! - 按目标类型和种类的滑动窗口限流
//!   - Sliding-window throttling by target type and kind
//! - 复刻权限求值语义的授权过滤历史查询
//!   - Authorization-filtered history queries reproducing permission semantics
//! - 事件内日志捕获，完成时落库
//!   - Per-event log capture, persisted on completion
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use evlock::{
//!   AllowedPermission, EventService, MemoryStore, Opts, Owner, OwnerType, PermissionScheme,
//!   Target, TargetType,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let service = EventService::new(Arc::new(MemoryStore::new()));
//!   let scheme = PermissionScheme::new("app.deploy");
//!   let evt = service
//!     .new_event(Opts {
//!       target: Some(Target::new(TargetType::App, "myapp")),
//!       kind: Some(scheme.clone()),
//!       raw_owner: Some(Owner::new(OwnerType::User, "alice")),
//!       allowed: AllowedPermission::new(&scheme, vec![]),
//!       ..Default::default()
//!     })
//!     .await?;
//!   // ... perform the mutation ...
//!   evt.done(None).await?;
//!   Ok(())
//! }
//! ```

use std::time::Duration;

pub mod custom_data;
pub mod error;
pub mod event;
pub mod filter;
pub mod log_buffer;
pub mod permission;
pub mod service;
pub mod store;
pub mod target;
pub mod throttling;

mod updater;

/// 心跳周期：锁时间戳的刷新间隔
/// Heartbeat interval: how often lock timestamps are refreshed
pub const LOCK_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// 锁过期时限：超过该时限未刷新的锁可被竞争者回收
/// Lock expiration: locks not refreshed within this window may be reclaimed
pub const LOCK_EXPIRE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 带过滤器查询的缺省及最大结果数
/// Default and maximum result count for filtered queries
pub const FILTER_MAX_LIMIT: i64 = 100;

pub use custom_data::form_to_custom_data;
pub use error::{Error, Result, ThrottledError};
pub use event::{CancelInfo, Event, EventData, EventId, Opts};
pub use filter::{Filter, TargetFilter};
pub use log_buffer::LogBuffer;
pub use permission::{
  AllowedPermission, ContextType, Permission, PermissionContext, PermissionScheme,
};
pub use service::{BlockChecker, EventService, EventServiceConfig};
pub use store::{Document, EventStore, FindOptions, MemoryStore};
pub use target::{AuthToken, Kind, KindType, Owner, OwnerType, Target, TargetType};
pub use throttling::ThrottlingSpec;
