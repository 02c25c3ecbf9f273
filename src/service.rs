//! 服务模块
//! Service module
//!
//! 事件子系统的入口：创建（即抢锁）、历史查询、逻辑删除和迁移驱动；
//! 限流表、心跳更新器和阻止注册表都归本服务所有
//! Entry point of the event subsystem: creation (lock acquisition), history
//! queries, logical removal and the migration driver; the throttling table, the
//! heartbeat updater and the block registry all live on the service
//!
//! 每个进程构建一个服务实例；测试各自构建实例即可互不干扰地复位。
//! Build one service instance per process; tests build their own instances and
//! reset without cross-test coupling.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::custom_data::marshal_custom_data;
use crate::error::{Error, Result, ThrottledError};
use crate::event::{from_document, to_document, CancelInfo, Event, EventData, EventId, Opts};
use crate::filter::Filter;
use crate::store::{EventStore, FindOptions};
use crate::target::{Kind, Owner, OwnerType, Target};
use crate::throttling::{ThrottlingRegistry, ThrottlingSpec};
use crate::updater::LockUpdater;
use crate::{FILTER_MAX_LIMIT, LOCK_EXPIRE_TIMEOUT, LOCK_UPDATE_INTERVAL};

/// 外部阻止注册表接入点
/// External block-registry seam
///
/// 对新建事件返回错误即为阻止；创建会通过 `done` 回滚并把该错误上抛。
/// Returning an error for a new event blocks it; creation rolls back via
/// `done` and surfaces that error.
#[async_trait]
pub trait BlockChecker: Send + Sync {
  async fn check(&self, event: &EventData) -> Result<()>;
}

/// 服务配置
/// Service configuration
#[derive(Debug, Clone)]
pub struct EventServiceConfig {
  /// 心跳周期
  /// Heartbeat interval
  pub lock_update_interval: Duration,
  /// 锁过期时限；持有者的心跳必须快于它
  /// Lock expiration; the holder must heartbeat faster than this
  pub lock_expire_timeout: Duration,
}

impl Default for EventServiceConfig {
  fn default() -> Self {
    Self {
      lock_update_interval: LOCK_UPDATE_INTERVAL,
      lock_expire_timeout: LOCK_EXPIRE_TIMEOUT,
    }
  }
}

pub(crate) struct ServiceCore {
  pub(crate) store: Arc<dyn EventStore>,
  pub(crate) updater: LockUpdater,
  pub(crate) throttling: ThrottlingRegistry,
  pub(crate) block_checker: RwLock<Option<Arc<dyn BlockChecker>>>,
  pub(crate) config: EventServiceConfig,
}

/// 事件服务
/// Event service
#[derive(Clone)]
pub struct EventService {
  core: Arc<ServiceCore>,
}

impl EventService {
  pub fn new(store: Arc<dyn EventStore>) -> Self {
    Self::with_config(store, EventServiceConfig::default())
  }

  pub fn with_config(store: Arc<dyn EventStore>, config: EventServiceConfig) -> Self {
    let updater = LockUpdater::new(store.clone(), config.lock_update_interval);
    Self {
      core: Arc::new(ServiceCore {
        store,
        updater,
        throttling: ThrottlingRegistry::default(),
        block_checker: RwLock::new(None),
        config,
      }),
    }
  }

  /// 注册一条限流规格；应在首次创建事件前完成
  /// Register a throttling spec; should happen before the first event creation
  pub fn set_throttling(&self, spec: ThrottlingSpec) {
    self.core.throttling.set(spec);
  }

  /// 安装阻止注册表
  /// Install the block registry
  pub fn set_block_checker(&self, checker: Arc<dyn BlockChecker>) {
    let mut guard = self
      .core
      .block_checker
      .write()
      .unwrap_or_else(|err| err.into_inner());
    *guard = Some(checker);
  }

  /// 停止心跳更新器并重新武装惰性启动，供测试复位
  /// Stop the heartbeat updater and re-arm the lazy start, for test resets
  pub async fn stop_updater(&self) {
    self.core.updater.stop().await;
  }

  /// 创建权限种类的事件
  /// Create a permission-kind event
  pub async fn new_event(&self, opts: Opts) -> Result<Event> {
    if opts.owner.is_none() && opts.raw_owner.is_none() {
      return Err(Error::no_owner());
    }
    if opts.kind.is_none() {
      return Err(Error::no_kind());
    }
    self.create(opts).await
  }

  /// 创建内部事件；所有者和权限种类必须缺省
  /// Create an internal event; owner and permission kind must be absent
  pub async fn new_internal(&self, opts: Opts) -> Result<Event> {
    if opts.owner.is_some() {
      return Err(Error::invalid_owner());
    }
    if opts.kind.is_some() {
      return Err(Error::invalid_kind());
    }
    if opts.internal_kind.as_deref().unwrap_or("").is_empty() {
      return Err(Error::no_internal_kind());
    }
    self.create(opts).await
  }

  async fn create(&self, opts: Opts) -> Result<Event> {
    self.core.updater.start();
    let target = opts.target.clone().ok_or_else(Error::no_target)?;
    if opts.allowed.is_empty() {
      return Err(Error::no_allowed());
    }
    if opts.cancelable && opts.allowed_cancel.is_empty() {
      return Err(Error::no_allowed_cancel());
    }
    let kind = match &opts.kind {
      Some(scheme) => Kind::permission(scheme.full_name()),
      None => match opts.internal_kind.as_deref() {
        Some(name) if !name.is_empty() => Kind::internal(name),
        _ => return Err(Error::no_kind()),
      },
    };
    let owner = match &opts.owner {
      Some(token) if token.is_app_token() => Owner::new(OwnerType::App, token.app_name()),
      Some(token) => Owner::new(OwnerType::User, token.user_name()),
      None => match &opts.raw_owner {
        Some(raw) if !raw.name.is_empty() => raw.clone(),
        _ => Owner::internal(),
      },
    };
    self.check_throttling(&target, &kind).await?;
    let now = Utc::now();
    let start_custom_data = marshal_custom_data(opts.custom_data.as_ref())?;
    let unique_id = Uuid::new_v4();
    let id = if opts.disable_lock {
      EventId::Unique(unique_id)
    } else {
      EventId::Lock(target.clone())
    };
    let data = EventData {
      id,
      unique_id,
      start_time: now,
      end_time: None,
      target: target.clone(),
      start_custom_data,
      end_custom_data: None,
      other_custom_data: None,
      kind,
      owner,
      lock_update_time: now,
      error: String::new(),
      log: String::new(),
      remove_date: None,
      cancel_info: CancelInfo::default(),
      cancelable: opts.cancelable,
      running: true,
      allowed: opts.allowed.clone(),
      allowed_cancel: opts.allowed_cancel.clone(),
    };
    let evt = Event::new(data, self.core.clone());
    let mut max_retries = 1;
    let mut attempt = 0;
    while attempt <= max_retries {
      match self.core.store.insert(to_document(&evt.data)?).await {
        Ok(()) => {
          let checker = {
            let guard = self
              .core
              .block_checker
              .read()
              .unwrap_or_else(|err| err.into_inner());
            guard.clone()
          };
          if let Some(checker) = checker {
            if let Err(block_err) = checker.check(&evt.data).await {
              let _ = evt.done(Some(block_err.to_string())).await;
              return Err(block_err);
            }
          }
          if !opts.disable_lock {
            self.core.updater.add(evt.data.target.clone()).await;
          }
          return Ok(evt);
        }
        Err(Error::DuplicateId) => {
          let id = evt.data.id.to_value()?;
          if attempt >= max_retries || !self.check_is_expired(&id).await {
            match self.core.store.find_one(&json!({"_id": id})).await? {
              Some(existing) => {
                return Err(Error::EventLocked(Box::new(from_document(existing)?)));
              }
              // the holder vanished between the insert and the read, worth one
              // more attempt
              None => max_retries += 1,
            }
          }
        }
        Err(err) => return Err(err),
      }
      attempt += 1;
    }
    Err(Error::DuplicateId)
  }

  async fn check_throttling(&self, target: &Target, kind: &Kind) -> Result<()> {
    let Some(spec) = self.core.throttling.get(target, kind) else {
      return Ok(());
    };
    if !spec.is_active() {
      return Ok(());
    }
    let window_start = Utc::now() - to_chrono(spec.time);
    let mut query = json!({
      "target.type": target.target_type,
      "target.value": target.value,
      "starttime": {"$gt": window_start.timestamp_millis()},
    });
    if !spec.kind_name.is_empty() {
      query["kind.name"] = json!(spec.kind_name);
    }
    let count = self.core.store.count(&query).await?;
    if count >= spec.max as u64 {
      return Err(
        ThrottledError {
          spec,
          target: target.clone(),
        }
        .into(),
      );
    }
    Ok(())
  }

  /// 检查目标槽位上的持有者是否已过期；过期则代为终结并让出槽位
  /// Check whether the holder of the target slot has expired; if so, terminate
  /// it on its behalf and free the slot
  async fn check_is_expired(&self, id: &Value) -> bool {
    let found = match self.core.store.find_one(&json!({"_id": id})).await {
      Ok(found) => found,
      Err(err) => {
        tracing::error!("[events] error reading lock holder: {}", err);
        return false;
      }
    };
    let Some(doc) = found else {
      return false;
    };
    let existing = match from_document(doc) {
      Ok(existing) => existing,
      Err(err) => {
        tracing::error!("[events] error decoding lock holder: {}", err);
        return false;
      }
    };
    let now = Utc::now();
    let last_update = existing.lock_update_time;
    if now <= last_update + to_chrono(self.core.config.lock_expire_timeout) {
      return false;
    }
    let elapsed = (now - last_update)
      .to_std()
      .unwrap_or(Duration::ZERO);
    let holder = Event::new(existing, self.core.clone());
    let _ = holder
      .done(Some(format!("event expired, no update for {:?}", elapsed)))
      .await;
    true
  }

  /// 按过滤器列出历史；缺省按 `starttime` 降序
  /// List history by filter; defaults to descending `starttime`
  pub async fn list(&self, filter: Option<&Filter>) -> Result<Vec<Event>> {
    let mut options = FindOptions {
      sort: Some("-starttime".to_string()),
      limit: 0,
      skip: 0,
    };
    let query = match filter {
      Some(filter) => {
        options.limit = if filter.limit != 0 {
          filter.limit
        } else {
          FILTER_MAX_LIMIT
        };
        if let Some(sort) = &filter.sort {
          options.sort = Some(sort.clone());
        }
        if filter.skip > 0 {
          options.skip = filter.skip;
        }
        match filter.to_query() {
          Ok(query) => query,
          Err(Error::InvalidQuery) => return Ok(Vec::new()),
          Err(err) => return Err(err),
        }
      }
      None => json!({}),
    };
    let docs = self.core.store.find(&query, &options).await?;
    docs
      .into_iter()
      .map(|doc| Ok(Event::new(from_document(doc)?, self.core.clone())))
      .collect()
  }

  /// 列出全部历史
  /// List the whole history
  pub async fn all(&self) -> Result<Vec<Event>> {
    self.list(None).await
  }

  /// 取目标上正在运行的指定种类事件
  /// Get the running event of a given kind on a target
  pub async fn get_running(&self, target: &Target, kind: &str) -> Result<Event> {
    let id = EventId::Lock(target.clone()).to_value()?;
    let query = json!({"_id": id, "kind.name": kind, "running": true});
    match self.core.store.find_one(&query).await? {
      Some(doc) => Ok(Event::new(from_document(doc)?, self.core.clone())),
      None => Err(Error::EventNotFound),
    }
  }

  /// 按稳定句柄取事件
  /// Get an event by its stable handle
  pub async fn get_by_id(&self, unique_id: Uuid) -> Result<Event> {
    let query = json!({"uniqueid": unique_id});
    match self.core.store.find_one(&query).await? {
      Some(doc) => Ok(Event::new(from_document(doc)?, self.core.clone())),
      None => Err(Error::EventNotFound),
    }
  }

  /// 历史中出现过的全部种类
  /// Every kind seen in the history
  pub async fn get_kinds(&self) -> Result<Vec<Kind>> {
    let values = self.core.store.distinct("kind", &json!({})).await?;
    values
      .into_iter()
      .map(|value| Ok(serde_json::from_value(value)?))
      .collect()
  }

  /// 逻辑删除目标上的全部事件
  /// Logically delete every event of a target
  pub async fn mark_as_removed(&self, target: &Target) -> Result<()> {
    let query = json!({
      "target": serde_json::to_value(target)?,
      "removedate": {"$exists": false},
    });
    let update = json!({"$set": {"removedate": Utc::now().timestamp_millis()}});
    self.core.store.update_many(&query, &update).await?;
    Ok(())
  }

  /// 直接以归档形态插入一行历史，供迁移和播种使用
  /// Insert one history row directly in archived form, for migrations and
  /// seeding
  pub async fn raw_insert(&self, mut data: EventData) -> Result<Event> {
    data.id = EventId::Unique(data.unique_id);
    let start = marshal_custom_data(data.start_custom_data.as_ref())?;
    let other = marshal_custom_data(data.other_custom_data.as_ref())?;
    let end = marshal_custom_data(data.end_custom_data.as_ref())?;
    data.start_custom_data = start;
    data.other_custom_data = other;
    data.end_custom_data = end;
    self.core.store.insert(to_document(&data)?).await?;
    Ok(Event::new(data, self.core.clone()))
  }

  /// 迁移驱动：对匹配查询的每个事件应用转换器并按当前主键写回
  /// Migration driver: apply a transformer to every matching event and write it
  /// back under its current key
  ///
  /// 基于时间点快照迭代，并发对其他事件的状态变化不会被覆盖。
  /// Iterates a point-in-time snapshot; concurrent state changes to other
  /// events are not overwritten.
  pub async fn migrate<F>(&self, query: &Value, mut transform: F) -> Result<()>
  where
    F: FnMut(&mut EventData) -> Result<()>,
  {
    let docs = self.core.store.find(query, &FindOptions::default()).await?;
    for doc in docs {
      let mut data = from_document(doc)?;
      transform(&mut data)
        .map_err(|err| Error::store(format!("unable to migrate {}: {}", data, err)))?;
      let id = data.id.to_value()?;
      self.core.store.replace_by_id(&id, to_document(&data)?).await?;
    }
    Ok(())
  }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
  chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
