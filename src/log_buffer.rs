//! 日志缓冲模块
//! Log buffer module
//!
//! 每个事件携带的线程安全文本缓冲，执行期间写入，完成时一次性落库
//! Thread-safe text buffer carried by each event, written during execution and
//! persisted in one shot on completion

use std::io;
use std::sync::{Arc, Mutex};

/// 可以廉价克隆的共享文本缓冲；克隆体共享同一份内容
/// Cheaply clonable shared text buffer; clones share the same contents
#[derive(Clone, Default)]
pub struct LogBuffer {
  inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// 追加一段文本
  /// Append a piece of text
  pub fn append(&self, text: &str) {
    let mut buf = self.inner.lock().unwrap_or_else(|err| err.into_inner());
    buf.extend_from_slice(text.as_bytes());
  }

  /// 当前内容的快照
  /// Snapshot of the current contents
  pub fn snapshot(&self) -> String {
    let buf = self.inner.lock().unwrap_or_else(|err| err.into_inner());
    String::from_utf8_lossy(&buf).into_owned()
  }

  pub fn is_empty(&self) -> bool {
    let buf = self.inner.lock().unwrap_or_else(|err| err.into_inner());
    buf.is_empty()
  }
}

impl io::Write for LogBuffer {
  fn write(&mut self, data: &[u8]) -> io::Result<usize> {
    let mut buf = self.inner.lock().unwrap_or_else(|err| err.into_inner());
    buf.extend_from_slice(data);
    Ok(data.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}
