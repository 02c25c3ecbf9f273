//! 内存存储实现
//! Memory store implementation
//!
//! 使用内存数据结构实现事件集合，不依赖任何外部服务；
//! 自带编译器所产出查询子集的求值器
//! Implements the events collection using in-memory data structures without any
//! external service dependencies; ships an evaluator for the query subset the
//! compiler emits

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::{Document, EventStore, FindOptions};

/// 内存事件存储
/// In-memory event store
///
/// `_id` 的唯一性由行表的键保证；键是 `_id` 值的规范 JSON 文本。
/// Uniqueness of `_id` is enforced by the row table key, the canonical JSON
/// text of the `_id` value.
#[derive(Default)]
pub struct MemoryStore {
  docs: RwLock<HashMap<String, Document>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn id_key(id: &Value) -> String {
    // serde_json maps are sorted by key, so the text form is canonical
    id.to_string()
  }

  fn doc_id_key(doc: &Document) -> Result<String> {
    let id = doc
      .get("_id")
      .ok_or_else(|| Error::store("document is missing _id"))?;
    Ok(Self::id_key(id))
  }
}

#[async_trait]
impl EventStore for MemoryStore {
  async fn insert(&self, doc: Document) -> Result<()> {
    let key = Self::doc_id_key(&doc)?;
    let mut docs = self.docs.write().await;
    if docs.contains_key(&key) {
      return Err(Error::DuplicateId);
    }
    docs.insert(key, doc);
    Ok(())
  }

  async fn find_one(&self, query: &Value) -> Result<Option<Document>> {
    let docs = self.docs.read().await;
    Ok(docs.values().find(|doc| matches(query, doc)).cloned())
  }

  async fn find(&self, query: &Value, options: &FindOptions) -> Result<Vec<Document>> {
    let docs = self.docs.read().await;
    let mut found: Vec<Document> = docs
      .values()
      .filter(|doc| matches(query, doc))
      .cloned()
      .collect();
    if let Some(sort) = &options.sort {
      sort_docs(&mut found, sort);
    }
    let skip = options.skip.max(0) as usize;
    if skip > 0 {
      found.drain(..skip.min(found.len()));
    }
    if options.limit > 0 {
      found.truncate(options.limit as usize);
    }
    Ok(found)
  }

  async fn count(&self, query: &Value) -> Result<u64> {
    let docs = self.docs.read().await;
    Ok(docs.values().filter(|doc| matches(query, doc)).count() as u64)
  }

  async fn update_by_id(&self, id: &Value, update: &Value) -> Result<()> {
    let key = Self::id_key(id);
    let mut docs = self.docs.write().await;
    match docs.get_mut(&key) {
      Some(doc) => apply_update(doc, update),
      None => Err(Error::EventNotFound),
    }
  }

  async fn replace_by_id(&self, id: &Value, doc: Document) -> Result<()> {
    let key = Self::id_key(id);
    let mut docs = self.docs.write().await;
    if !docs.contains_key(&key) {
      return Err(Error::EventNotFound);
    }
    docs.insert(key, doc);
    Ok(())
  }

  async fn update_many(&self, query: &Value, update: &Value) -> Result<u64> {
    let mut docs = self.docs.write().await;
    let mut modified = 0;
    for doc in docs.values_mut() {
      if matches(query, doc) {
        apply_update(doc, update)?;
        modified += 1;
      }
    }
    Ok(modified)
  }

  async fn find_one_and_update(&self, query: &Value, update: &Value) -> Result<Option<Document>> {
    let mut docs = self.docs.write().await;
    for doc in docs.values_mut() {
      if matches(query, doc) {
        apply_update(doc, update)?;
        return Ok(Some(doc.clone()));
      }
    }
    Ok(None)
  }

  async fn delete_by_id(&self, id: &Value) -> Result<()> {
    let key = Self::id_key(id);
    let mut docs = self.docs.write().await;
    match docs.remove(&key) {
      Some(_) => Ok(()),
      None => Err(Error::EventNotFound),
    }
  }

  async fn distinct(&self, key: &str, query: &Value) -> Result<Vec<Value>> {
    let docs = self.docs.read().await;
    let mut values = Vec::new();
    for doc in docs.values() {
      if !matches(query, doc) {
        continue;
      }
      if let Some(value) = resolve_path(doc, key) {
        if !values.contains(value) {
          values.push(value.clone());
        }
      }
    }
    Ok(values)
  }
}

/// 查询求值：文档是否满足查询
/// Query evaluation: does the document satisfy the query
fn matches(query: &Value, doc: &Document) -> bool {
  let Some(clauses) = query.as_object() else {
    return false;
  };
  for (key, cond) in clauses {
    let ok = match key.as_str() {
      "$or" => cond
        .as_array()
        .is_some_and(|subs| subs.iter().any(|sub| matches(sub, doc))),
      "$and" => cond
        .as_array()
        .is_some_and(|subs| subs.iter().all(|sub| matches(sub, doc))),
      path => match_condition(resolve_path(doc, path), cond),
    };
    if !ok {
      return false;
    }
  }
  true
}

/// 沿点路径解析字段
/// Resolve a field along a dotted path
fn resolve_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
  let mut segments = path.split('.');
  let mut current = doc.get(segments.next()?)?;
  for segment in segments {
    current = current.as_object()?.get(segment)?;
  }
  Some(current)
}

fn match_condition(field: Option<&Value>, cond: &Value) -> bool {
  if let Some(ops) = cond.as_object() {
    if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) {
      return ops
        .iter()
        .all(|(op, operand)| apply_operator(field, op, operand));
    }
  }
  match field {
    Some(value) => value_eq(value, cond),
    None => cond.is_null(),
  }
}

/// 相等匹配；数组字段额外按成员匹配
/// Equality match; array fields additionally match by membership
fn value_eq(field: &Value, expected: &Value) -> bool {
  if field == expected {
    return true;
  }
  field
    .as_array()
    .is_some_and(|items| items.contains(expected))
}

fn apply_operator(field: Option<&Value>, op: &str, operand: &Value) -> bool {
  match op {
    "$eq" => field.is_some_and(|value| value_eq(value, operand)),
    "$ne" => match field {
      Some(value) => !value_eq(value, operand),
      None => !operand.is_null(),
    },
    "$gt" => compare(field, operand).is_some_and(|ord| ord == Ordering::Greater),
    "$gte" => compare(field, operand).is_some_and(|ord| ord != Ordering::Less),
    "$lt" => compare(field, operand).is_some_and(|ord| ord == Ordering::Less),
    "$lte" => compare(field, operand).is_some_and(|ord| ord != Ordering::Greater),
    "$in" => match (field, operand.as_array()) {
      (Some(Value::Array(items)), Some(candidates)) => {
        items.iter().any(|item| candidates.contains(item))
      }
      (Some(value), Some(candidates)) => candidates.contains(value),
      _ => false,
    },
    "$exists" => operand.as_bool().is_some_and(|want| want == field.is_some()),
    "$regex" => match (field.and_then(Value::as_str), operand.as_str()) {
      (Some(text), Some(pattern)) => Regex::new(pattern).is_ok_and(|re| re.is_match(text)),
      _ => false,
    },
    _ => false,
  }
}

fn compare(field: Option<&Value>, operand: &Value) -> Option<Ordering> {
  let field = field?;
  if let (Some(a), Some(b)) = (field.as_i64(), operand.as_i64()) {
    return Some(a.cmp(&b));
  }
  if let (Some(a), Some(b)) = (field.as_f64(), operand.as_f64()) {
    return a.partial_cmp(&b);
  }
  if let (Some(a), Some(b)) = (field.as_str(), operand.as_str()) {
    return Some(a.cmp(b));
  }
  None
}

/// 应用 `$set` 更新；点路径会按需创建中间文档
/// Apply a `$set` update; dotted paths create intermediate documents as needed
fn apply_update(doc: &mut Document, update: &Value) -> Result<()> {
  let Some(ops) = update.as_object() else {
    return Err(Error::store("update is not a document"));
  };
  for (op, fields) in ops {
    if op != "$set" {
      return Err(Error::store(format!("unsupported update operator {op}")));
    }
    let Some(fields) = fields.as_object() else {
      return Err(Error::store("$set operand is not a document"));
    };
    for (path, value) in fields {
      set_path(doc, path, value.clone());
    }
  }
  Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
  let mut segments: Vec<&str> = path.split('.').collect();
  let last = match segments.pop() {
    Some(last) => last,
    None => return,
  };
  let mut current = doc;
  for segment in segments {
    let entry = current
      .entry(segment.to_string())
      .or_insert_with(|| Value::Object(Document::new()));
    if !entry.is_object() {
      *entry = Value::Object(Document::new());
    }
    current = match entry.as_object_mut() {
      Some(obj) => obj,
      None => return,
    };
  }
  current.insert(last.to_string(), value);
}

/// 按单字段排序，`-` 前缀表示降序
/// Sort by a single field, a `-` prefix means descending
fn sort_docs(docs: &mut [Document], sort: &str) {
  let (field, descending) = match sort.strip_prefix('-') {
    Some(field) => (field, true),
    None => (sort, false),
  };
  docs.sort_by(|a, b| {
    let ord = match (resolve_path(a, field), resolve_path(b, field)) {
      (Some(va), Some(vb)) => compare(Some(va), vb).unwrap_or(Ordering::Equal),
      (Some(_), None) => Ordering::Greater,
      (None, Some(_)) => Ordering::Less,
      (None, None) => Ordering::Equal,
    };
    if descending {
      ord.reverse()
    } else {
      ord
    }
  });
}
