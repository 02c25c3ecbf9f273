//! 锁更新器模块
//! Lock updater module
//!
//! 每个服务一个长驻协作任务，周期性刷新所有在运行事件的锁时间戳，
//! 以此向同目标的竞争者证明持有者仍然存活
//! One long-lived cooperative task per service, periodically refreshing the lock
//! timestamps of all running events, proving to competitors on the same target
//! that the holder is still alive

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::store::EventStore;
use crate::target::Target;

const CHANNEL_CAPACITY: usize = 128;

struct Channels {
  add_tx: mpsc::Sender<Target>,
  remove_tx: mpsc::Sender<Target>,
  stop_tx: mpsc::Sender<()>,
}

/// 心跳更新器
/// Heartbeat updater
///
/// 首次创建事件时惰性启动，并发进入下保持幂等；`stop` 协作退出并重新武装
/// 初始化器，便于测试复位。
/// Started lazily on first event creation, idempotent under concurrent entry;
/// `stop` exits cooperatively and re-arms the initializer so tests can reset.
pub(crate) struct LockUpdater {
  store: Arc<dyn EventStore>,
  interval: Duration,
  channels: Mutex<Option<Channels>>,
}

impl LockUpdater {
  pub fn new(store: Arc<dyn EventStore>, interval: Duration) -> Self {
    Self {
      store,
      interval,
      channels: Mutex::new(None),
    }
  }

  /// 启动心跳循环；已在运行时是空操作
  /// Start the heartbeat loop; a no-op when already running
  pub fn start(&self) {
    let mut channels = self.channels.lock().unwrap_or_else(|err| err.into_inner());
    if channels.is_some() {
      return;
    }
    let (add_tx, add_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (remove_tx, remove_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = mpsc::channel(1);
    tokio::spawn(run_loop(
      self.store.clone(),
      self.interval,
      add_rx,
      remove_rx,
      stop_rx,
    ));
    *channels = Some(Channels {
      add_tx,
      remove_tx,
      stop_tx,
    });
  }

  /// 注册一个被锁定的目标
  /// Register a locked target
  pub async fn add(&self, target: Target) {
    if let Some(tx) = self.sender(|channels| channels.add_tx.clone()) {
      if tx.send(target).await.is_err() {
        tracing::warn!("[lock update] updater is gone, add dropped");
      }
    }
  }

  /// 注销一个目标；每次注册必须恰好对应一次注销
  /// Unregister a target; every add must be matched by exactly one remove
  pub async fn remove(&self, target: Target) {
    if let Some(tx) = self.sender(|channels| channels.remove_tx.clone()) {
      if tx.send(target).await.is_err() {
        tracing::warn!("[lock update] updater is gone, remove dropped");
      }
    }
  }

  /// 协作停止并重新武装惰性初始化器
  /// Stop cooperatively and re-arm the lazy initializer
  pub async fn stop(&self) {
    let stopped = {
      let mut channels = self.channels.lock().unwrap_or_else(|err| err.into_inner());
      channels.take()
    };
    if let Some(channels) = stopped {
      let _ = channels.stop_tx.send(()).await;
    }
  }

  fn sender<T>(&self, pick: impl FnOnce(&Channels) -> T) -> Option<T> {
    let channels = self.channels.lock().unwrap_or_else(|err| err.into_inner());
    channels.as_ref().map(pick)
  }
}

async fn run_loop(
  store: Arc<dyn EventStore>,
  interval: Duration,
  mut add_rx: mpsc::Receiver<Target>,
  mut remove_rx: mpsc::Receiver<Target>,
  mut stop_rx: mpsc::Receiver<()>,
) {
  let mut set: HashSet<Target> = HashSet::new();
  loop {
    tokio::select! {
      added = add_rx.recv() => match added {
        Some(target) => { set.insert(target); }
        None => break,
      },
      removed = remove_rx.recv() => match removed {
        Some(target) => { set.remove(&target); }
        None => break,
      },
      _ = stop_rx.recv() => break,
      _ = tokio::time::sleep(interval) => {}
    }
    if set.is_empty() {
      continue;
    }
    let mut ids = Vec::with_capacity(set.len());
    for target in &set {
      match serde_json::to_value(target) {
        Ok(id) => ids.push(id),
        Err(err) => tracing::error!("[lock update] error encoding id: {}", err),
      }
    }
    let query = json!({"_id": {"$in": ids}});
    let update = json!({"$set": {"lockupdatetime": Utc::now().timestamp_millis()}});
    if let Err(err) = store.update_many(&query, &update).await {
      tracing::error!("[lock update] error updating: {}", err);
    }
  }
}
