//! 事件模块
//! Event module
//!
//! 事件的持久化形态、创建选项和进程内句柄；句柄上承载完成、取消与日志操作
//! The persistent shape of an event, its creation options and the in-process
//! handle; completion, cancellation and logging live on the handle
//!
//! 事件的主键是一个双形态的标签联合：运行期间主键是目标本身（锁定形态），
//! 存储的唯一性索引由此提供互斥；终止后主键改写为全局唯一标识（归档形态），
//! 让同一目标可以再次上锁。
//! The event primary key is a two-shape tagged union: while running the key is
//! the target itself (locked form) and the store's uniqueness index provides
//! mutual exclusion; on termination the key is rewritten to the globally unique
//! id (archived form) so the same target can be locked again.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::io;
use std::io::Write as _;
use std::ops::Deref;
use std::sync::Arc;
use uuid::Uuid;

use crate::custom_data::marshal_custom_data;
use crate::error::{Error, Result};
use crate::log_buffer::LogBuffer;
use crate::permission::AllowedPermission;
use crate::service::ServiceCore;
use crate::store::Document;
use crate::target::{AuthToken, Kind, Owner, Target};

/// 事件主键，锁定形态或归档形态，任一时刻恰为其一
/// Event primary key, locked or archived form, exactly one at any time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventId {
  /// 锁定形态：主键是目标子文档
  /// Locked form: the key is the target subdocument
  Lock(Target),
  /// 归档形态：主键是全局唯一标识
  /// Archived form: the key is the globally unique id
  Unique(Uuid),
}

impl EventId {
  pub fn is_unique(&self) -> bool {
    matches!(self, Self::Unique(_))
  }

  pub(crate) fn to_value(&self) -> Result<Value> {
    Ok(serde_json::to_value(self)?)
  }
}

/// 取消协议的状态：观察者先问，执行者后答
/// Cancellation protocol state: the observer asks, the executor acks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelInfo {
  #[serde(default)]
  pub owner: String,
  #[serde(
    rename = "starttime",
    default,
    with = "chrono::serde::ts_milliseconds_option"
  )]
  pub start_time: Option<DateTime<Utc>>,
  #[serde(
    rename = "acktime",
    default,
    with = "chrono::serde::ts_milliseconds_option"
  )]
  pub ack_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub reason: String,
  #[serde(default)]
  pub asked: bool,
  #[serde(default)]
  pub canceled: bool,
}

/// 事件的持久化形态
/// The persistent shape of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
  #[serde(rename = "_id")]
  pub id: EventId,
  /// 创建时分配、跨形态不变的稳定句柄
  /// Stable handle assigned at creation, preserved across form changes
  #[serde(rename = "uniqueid")]
  pub unique_id: Uuid,
  #[serde(rename = "starttime", with = "chrono::serde::ts_milliseconds")]
  pub start_time: DateTime<Utc>,
  #[serde(
    rename = "endtime",
    default,
    skip_serializing_if = "Option::is_none",
    with = "chrono::serde::ts_milliseconds_option"
  )]
  pub end_time: Option<DateTime<Utc>>,
  /// 顶层冗余一份目标，供索引查询
  /// Target duplicated at top level for indexed querying
  pub target: Target,
  #[serde(
    rename = "startcustomdata",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub start_custom_data: Option<Value>,
  #[serde(
    rename = "endcustomdata",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub end_custom_data: Option<Value>,
  #[serde(
    rename = "othercustomdata",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub other_custom_data: Option<Value>,
  pub kind: Kind,
  pub owner: Owner,
  #[serde(rename = "lockupdatetime", with = "chrono::serde::ts_milliseconds")]
  pub lock_update_time: DateTime<Utc>,
  /// 失败或被取消时非空
  /// Non-empty when the event failed or was cancelled
  #[serde(default)]
  pub error: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub log: String,
  /// 置位即逻辑删除；默认查询将其排除
  /// Set means logically deleted; default queries exclude it
  #[serde(
    rename = "removedate",
    default,
    skip_serializing_if = "Option::is_none",
    with = "chrono::serde::ts_milliseconds_option"
  )]
  pub remove_date: Option<DateTime<Utc>>,
  #[serde(rename = "cancelinfo", default)]
  pub cancel_info: CancelInfo,
  #[serde(default)]
  pub cancelable: bool,
  pub running: bool,
  pub allowed: AllowedPermission,
  #[serde(rename = "allowedcancel", default)]
  pub allowed_cancel: AllowedPermission,
}

impl fmt::Display for EventData {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}({}) running {:?} start by {} at {}",
      self.target.target_type,
      self.target.value,
      self.kind.name,
      self.owner,
      self.start_time.to_rfc3339(),
    )
  }
}

pub(crate) fn to_document(data: &EventData) -> Result<Document> {
  match serde_json::to_value(data)? {
    Value::Object(map) => Ok(map),
    _ => Err(Error::store("event did not serialize to a document")),
  }
}

pub(crate) fn from_document(doc: Document) -> Result<EventData> {
  Ok(serde_json::from_value(Value::Object(doc))?)
}

/// 事件创建选项
/// Event creation options
#[derive(Clone, Default)]
pub struct Opts {
  pub target: Option<Target>,
  /// 权限种类；与 `internal_kind` 互斥
  /// Permission kind; mutually exclusive with `internal_kind`
  pub kind: Option<crate::permission::PermissionScheme>,
  pub internal_kind: Option<String>,
  /// 认证主体；所有者由它派生
  /// Auth principal; the owner is derived from it
  pub owner: Option<Arc<dyn AuthToken>>,
  /// 没有主体时直接给出的所有者
  /// Owner passed through when no principal is present
  pub raw_owner: Option<Owner>,
  pub custom_data: Option<Value>,
  /// 禁用锁的事件不占据目标主键槽位，可与同目标的其他事件共存
  /// A lock-disabled event never occupies the target key slot and can coexist
  /// with other events on the same target
  pub disable_lock: bool,
  pub cancelable: bool,
  pub allowed: AllowedPermission,
  pub allowed_cancel: AllowedPermission,
}

impl fmt::Debug for Opts {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Opts")
      .field("target", &self.target)
      .field("kind", &self.kind)
      .field("internal_kind", &self.internal_kind)
      .field("has_owner", &self.owner.is_some())
      .field("raw_owner", &self.raw_owner)
      .field("disable_lock", &self.disable_lock)
      .field("cancelable", &self.cancelable)
      .finish()
  }
}

/// 进程内事件句柄
/// In-process event handle
///
/// 只读访问通过 `Deref` 到 [`EventData`]；生命周期操作消耗句柄。
/// Read access derefs to [`EventData`]; lifecycle operations consume the handle.
pub struct Event {
  pub(crate) data: EventData,
  pub(crate) core: Arc<ServiceCore>,
  log_buffer: LogBuffer,
  log_writer: Option<Box<dyn io::Write + Send>>,
}

impl Deref for Event {
  type Target = EventData;

  fn deref(&self) -> &EventData {
    &self.data
  }
}

impl fmt::Debug for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Event").field("data", &self.data).finish()
  }
}

impl fmt::Display for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.data.fmt(f)
  }
}

impl Event {
  pub(crate) fn new(data: EventData, core: Arc<ServiceCore>) -> Self {
    Self {
      data,
      core,
      log_buffer: LogBuffer::new(),
      log_writer: None,
    }
  }

  pub fn data(&self) -> &EventData {
    &self.data
  }

  /// 解码创建时写入的自定义数据
  /// Decode the custom data written at creation
  pub fn start_data<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    decode_custom_data(&self.data.start_custom_data)
  }

  /// 解码完成时写入的自定义数据
  /// Decode the custom data written at completion
  pub fn end_data<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    decode_custom_data(&self.data.end_custom_data)
  }

  /// 解码带外更新的自定义数据
  /// Decode the out-of-band custom data
  pub fn other_data<T: DeserializeOwned>(&self) -> Result<Option<T>> {
    decode_custom_data(&self.data.other_custom_data)
  }

  /// 外挂一个额外的日志写入端
  /// Attach an additional external log writer
  pub fn set_log_writer(&mut self, writer: Box<dyn io::Write + Send>) {
    self.log_writer = Some(writer);
  }

  /// 共享日志缓冲的句柄，供并发读者使用
  /// Handle to the shared log buffer, for concurrent readers
  pub fn log_buffer(&self) -> LogBuffer {
    self.log_buffer.clone()
  }

  /// 写一行日志：进调试日志、外部写入端和事件缓冲
  /// Log one line: to the debug sink, the external writer and the event buffer
  pub fn logf<S: AsRef<str>>(&mut self, message: S) {
    let message = message.as_ref();
    tracing::debug!(
      "{}({})[{}] {}",
      self.data.target.target_type,
      self.data.target.value,
      self.data.kind,
      message
    );
    let line = format!("{message}\n");
    if let Some(writer) = self.log_writer.as_mut() {
      let _ = writer.write_all(line.as_bytes());
    }
    self.log_buffer.append(&line);
  }

  /// 带外更新 `othercustomdata`；完成时会并回归档行
  /// Out-of-band update of `othercustomdata`; merged into the archived row on
  /// completion
  pub async fn set_other_custom_data(&self, data: &Value) -> Result<()> {
    let id = self.data.id.to_value()?;
    self
      .core
      .store
      .update_by_id(&id, &json!({"$set": {"othercustomdata": data}}))
      .await
  }

  /// 取消协议第一阶段：请求取消
  /// Cancellation phase one: ask
  ///
  /// 仅当 `cancelinfo.asked` 仍为假时原子置位；没有匹配说明不可取消或已被
  /// 请求过。
  /// Atomically sets the flag only while `cancelinfo.asked` is still false; no
  /// match means not cancelable or already asked.
  pub async fn try_cancel(&mut self, reason: &str, owner: &str) -> Result<()> {
    if !self.data.cancelable || !self.data.running {
      return Err(Error::NotCancelable);
    }
    let info = CancelInfo {
      owner: owner.to_string(),
      reason: reason.to_string(),
      start_time: Some(Utc::now()),
      ack_time: None,
      asked: true,
      canceled: false,
    };
    let id = self.data.id.to_value()?;
    let query = json!({"_id": id, "cancelinfo.asked": false});
    let update = json!({"$set": {"cancelinfo": serde_json::to_value(&info)?}});
    match self.core.store.find_one_and_update(&query, &update).await? {
      Some(doc) => {
        self.data = from_document(doc)?;
        Ok(())
      }
      None => Err(Error::EventNotFound),
    }
  }

  /// 取消协议第二阶段：执行者在安全点轮询应答
  /// Cancellation phase two: the executor polls and acks at safe points
  ///
  /// 返回是否发生了应答。
  /// Returns whether an ack occurred.
  pub async fn ack_cancel(&mut self) -> Result<bool> {
    if !self.data.cancelable || !self.data.running {
      return Ok(false);
    }
    let id = self.data.id.to_value()?;
    let query = json!({"_id": id, "cancelinfo.asked": true});
    let update = json!({"$set": {
      "cancelinfo.acktime": Utc::now().timestamp_millis(),
      "cancelinfo.canceled": true,
    }});
    match self.core.store.find_one_and_update(&query, &update).await? {
      Some(doc) => {
        self.data = from_document(doc)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// 中止：直接移除事件行，不留归档
  /// Abort: remove the event row outright, no archive
  pub async fn abort(self) -> Result<()> {
    self.finish(None, None, true).await
  }

  /// 完成事件
  /// Complete the event
  pub async fn done(self, evt_err: Option<String>) -> Result<()> {
    self.finish(evt_err, None, false).await
  }

  /// 完成事件并附上结束自定义数据
  /// Complete the event with end custom data
  pub async fn done_custom_data(self, evt_err: Option<String>, custom_data: &Value) -> Result<()> {
    self.finish(evt_err, Some(custom_data), false).await
  }

  // Done usually runs inside a finalizer that ignores errors, so failures are
  // also logged here.
  async fn finish(
    mut self,
    evt_err: Option<String>,
    custom_data: Option<&Value>,
    abort: bool,
  ) -> Result<()> {
    let description = self.data.to_string();
    let result = self.finish_inner(evt_err, custom_data, abort).await;
    if let Err(err) = &result {
      tracing::error!("[events] error marking event as done - {}: {}", description, err);
    }
    result
  }

  async fn finish_inner(
    &mut self,
    evt_err: Option<String>,
    custom_data: Option<&Value>,
    abort: bool,
  ) -> Result<()> {
    self.core.updater.remove(self.data.target.clone()).await;
    let store = &self.core.store;
    let id = self.data.id.to_value()?;
    if abort {
      return store.delete_by_id(&id).await;
    }
    if let Some(message) = evt_err {
      self.data.error = message;
    } else if self.data.cancel_info.canceled {
      self.data.error = "canceled by user request".to_string();
    }
    self.data.end_time = Some(Utc::now());
    self.data.end_custom_data = marshal_custom_data(custom_data)?;
    self.data.running = false;
    let log = self.log_buffer.snapshot();
    if !log.is_empty() {
      self.data.log = log;
    }
    // merge othercustomdata that may have been updated out-of-band
    if let Some(db_row) = store.find_one(&json!({"_id": id.clone()})).await? {
      self.data.other_custom_data = db_row.get("othercustomdata").cloned();
    }
    match &self.data.id {
      EventId::Unique(_) => store.replace_by_id(&id, to_document(&self.data)?).await,
      EventId::Lock(_) => {
        // archive first, then release the lock row; a crash in between leaves
        // the history complete and the lock to expire on its own
        self.data.id = EventId::Unique(self.data.unique_id);
        store.insert(to_document(&self.data)?).await?;
        if let Err(err) = store.delete_by_id(&id).await {
          tracing::warn!(
            "[events] error releasing lock row for {}: {}",
            self.data.target,
            err
          );
        }
        Ok(())
      }
    }
  }
}

impl io::Write for Event {
  fn write(&mut self, data: &[u8]) -> io::Result<usize> {
    if let Some(writer) = self.log_writer.as_mut() {
      let _ = writer.write(data);
    }
    self.log_buffer.clone().write(data)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

fn decode_custom_data<T: DeserializeOwned>(data: &Option<Value>) -> Result<Option<T>> {
  match data {
    None => Ok(None),
    Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
  }
}
