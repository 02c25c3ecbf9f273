use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use evlock::{
  AllowedPermission, AuthToken, BlockChecker, CancelInfo, ContextType, Error, EventData,
  EventId, EventService, EventServiceConfig, Kind, MemoryStore, Opts, Owner, OwnerType,
  PermissionContext, PermissionScheme, Target, TargetType, ThrottlingSpec,
};

struct UserToken(&'static str);

impl AuthToken for UserToken {
  fn is_app_token(&self) -> bool {
    false
  }

  fn app_name(&self) -> String {
    String::new()
  }

  fn user_name(&self) -> String {
    self.0.to_string()
  }
}

fn service() -> EventService {
  EventService::new(Arc::new(MemoryStore::new()))
}

fn deploy_opts(target_value: &str) -> Opts {
  let scheme = PermissionScheme::new("app.deploy");
  Opts {
    target: Some(Target::new(TargetType::App, target_value)),
    kind: Some(scheme.clone()),
    owner: Some(Arc::new(UserToken("alice"))),
    allowed: AllowedPermission::new(
      &scheme,
      vec![PermissionContext::new(ContextType::Team, "t1")],
    ),
    ..Default::default()
  }
}

#[tokio::test]
async fn test_happy_path() {
  let service = service();
  let evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  assert!(evt.running);
  assert!(!evt.id.is_unique());
  assert_eq!(evt.kind.name, "app.deploy");
  assert_eq!(evt.owner, Owner::new(OwnerType::User, "alice"));
  let unique_id = evt.unique_id;

  tokio::time::sleep(Duration::from_millis(10)).await;
  evt.done(None).await.unwrap();

  let events = service.all().await.unwrap();
  assert_eq!(events.len(), 1);
  let archived = &events[0];
  assert_eq!(archived.unique_id, unique_id);
  assert!(!archived.running);
  assert!(archived.id.is_unique());
  assert_eq!(archived.error, "");
  assert!(archived.end_time.unwrap() > archived.start_time);
}

#[tokio::test]
async fn test_lock_conflict() {
  let service = service();
  let first = service.new_event(deploy_opts("myapp")).await.unwrap();

  let err = service.new_event(deploy_opts("myapp")).await.unwrap_err();
  match err {
    Error::EventLocked(existing) => {
      assert_eq!(existing.unique_id, first.unique_id);
      assert!(existing.running);
    }
    other => panic!("expected EventLocked, got {other:?}"),
  }

  // a different target is unaffected
  let other = service.new_event(deploy_opts("otherapp")).await.unwrap();
  other.done(None).await.unwrap();

  // once released the slot can be taken again
  first.done(None).await.unwrap();
  let again = service.new_event(deploy_opts("myapp")).await.unwrap();
  again.done(None).await.unwrap();
}

#[tokio::test]
async fn test_expired_lock_takeover() {
  let store = Arc::new(MemoryStore::new());
  let service = EventService::with_config(
    store,
    EventServiceConfig {
      // no heartbeats within the test window
      lock_update_interval: Duration::from_secs(3600),
      lock_expire_timeout: Duration::from_millis(50),
    },
  );
  let first = service.new_event(deploy_opts("myapp")).await.unwrap();
  let first_id = first.unique_id;

  tokio::time::sleep(Duration::from_millis(120)).await;

  let second = service.new_event(deploy_opts("myapp")).await.unwrap();
  assert_ne!(second.unique_id, first_id);

  let expired = service.get_by_id(first_id).await.unwrap();
  assert!(!expired.running);
  assert!(expired.error.contains("expired"));
  second.done(None).await.unwrap();
}

#[tokio::test]
async fn test_throttling() {
  let service = service();
  service.set_throttling(ThrottlingSpec {
    target_type: TargetType::App,
    kind_name: String::new(),
    max: 2,
    time: Duration::from_secs(3600),
  });
  let mut opts = deploy_opts("myapp");
  opts.disable_lock = true;

  for _ in 0..2 {
    let evt = service.new_event(opts.clone()).await.unwrap();
    evt.done(None).await.unwrap();
  }
  let err = service.new_event(opts.clone()).await.unwrap_err();
  match err {
    Error::Throttled(throttled) => {
      assert_eq!(throttled.spec.max, 2);
      assert_eq!(throttled.target.value, "myapp");
      assert!(throttled.to_string().starts_with("event throttled"));
    }
    other => panic!("expected Throttled, got {other:?}"),
  }

  // other target values are counted separately
  let mut other = deploy_opts("otherapp");
  other.disable_lock = true;
  let evt = service.new_event(other).await.unwrap();
  evt.done(None).await.unwrap();
}

#[tokio::test]
async fn test_cancel_flow() {
  let service = service();
  let scheme = PermissionScheme::new("app.deploy");
  let mut opts = deploy_opts("myapp");
  opts.cancelable = true;
  opts.allowed_cancel = AllowedPermission::new(&scheme, vec![PermissionContext::global()]);
  let mut evt = service.new_event(opts).await.unwrap();

  let target = Target::new(TargetType::App, "myapp");
  let mut observer = service.get_running(&target, "app.deploy").await.unwrap();
  observer.try_cancel("stop", "alice").await.unwrap();
  assert!(observer.cancel_info.asked);

  // a second ask finds no askable row
  let mut other_observer = service.get_running(&target, "app.deploy").await.unwrap();
  let err = other_observer.try_cancel("again", "bob").await.unwrap_err();
  assert!(matches!(err, Error::EventNotFound));

  // the executor acknowledges at its next safe point
  let acked = evt.ack_cancel().await.unwrap();
  assert!(acked);
  assert!(evt.cancel_info.canceled);
  assert!(evt.cancel_info.ack_time.is_some());

  let unique_id = evt.unique_id;
  evt.done(None).await.unwrap();

  let archived = service.get_by_id(unique_id).await.unwrap();
  assert_eq!(archived.error, "canceled by user request");
  let info: &CancelInfo = &archived.cancel_info;
  assert!(info.asked);
  assert!(info.canceled);
  assert_eq!(info.owner, "alice");
  assert_eq!(info.reason, "stop");
  assert!(info.ack_time.is_some());
}

#[tokio::test]
async fn test_cancel_requires_cancelable() {
  let service = service();
  let mut evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  let err = evt.try_cancel("stop", "alice").await.unwrap_err();
  assert!(matches!(err, Error::NotCancelable));
  let acked = evt.ack_cancel().await.unwrap();
  assert!(!acked);
  evt.done(None).await.unwrap();
}

#[tokio::test]
async fn test_disable_lock_coexistence() {
  let service = service();
  let mut opts = deploy_opts("myapp");
  opts.disable_lock = true;
  let first = service.new_event(opts.clone()).await.unwrap();
  assert!(first.id.is_unique());
  let second = service.new_event(opts).await.unwrap();

  // and a locked event can still take the slot
  let locked = service.new_event(deploy_opts("myapp")).await.unwrap();

  first.done(None).await.unwrap();
  second.done(None).await.unwrap();
  locked.done(None).await.unwrap();
  assert_eq!(service.all().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_validation_errors() {
  let service = service();
  let scheme = PermissionScheme::new("app.deploy");

  let err = service.new_event(Opts::default()).await.unwrap_err();
  assert_eq!(err.to_string(), "event owner is mandatory");

  let err = service
    .new_event(Opts {
      raw_owner: Some(Owner::new(OwnerType::User, "alice")),
      ..Default::default()
    })
    .await
    .unwrap_err();
  assert_eq!(err.to_string(), "event kind is mandatory");

  let mut no_target = deploy_opts("myapp");
  no_target.target = None;
  let err = service.new_event(no_target).await.unwrap_err();
  assert_eq!(err.to_string(), "event target is mandatory");

  let mut no_allowed = deploy_opts("myapp");
  no_allowed.allowed = AllowedPermission::default();
  let err = service.new_event(no_allowed).await.unwrap_err();
  assert_eq!(err.to_string(), "event allowed is mandatory");

  let mut cancelable = deploy_opts("myapp");
  cancelable.cancelable = true;
  let err = service.new_event(cancelable).await.unwrap_err();
  assert_eq!(
    err.to_string(),
    "event allowed cancel is mandatory for cancelable events"
  );

  // internal events reject owner and permission kind
  let err = service
    .new_internal(Opts {
      owner: Some(Arc::new(UserToken("alice"))),
      ..Default::default()
    })
    .await
    .unwrap_err();
  assert_eq!(
    err.to_string(),
    "event owner must not be set on internal events"
  );

  let err = service
    .new_internal(Opts {
      kind: Some(scheme.clone()),
      ..Default::default()
    })
    .await
    .unwrap_err();
  assert_eq!(
    err.to_string(),
    "event kind must not be set on internal events"
  );

  let err = service.new_internal(Opts::default()).await.unwrap_err();
  assert_eq!(err.to_string(), "event internal kind is mandatory");
  assert!(err.is_validation());
}

#[tokio::test]
async fn test_internal_event() {
  let service = service();
  let scheme = PermissionScheme::new("node.autoscale");
  let evt = service
    .new_internal(Opts {
      target: Some(Target::new(TargetType::Pool, "pool1")),
      internal_kind: Some("autoscaler".to_string()),
      allowed: AllowedPermission::new(&scheme, vec![]),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(evt.owner, Owner::internal());
  assert_eq!(evt.kind.name, "autoscaler");
  evt.done(None).await.unwrap();
}

#[tokio::test]
async fn test_custom_data_round_trip() {
  let service = service();
  let mut opts = deploy_opts("myapp");
  opts.custom_data = Some(json!({"image": "v10", "user": "alice"}));
  let evt = service.new_event(opts).await.unwrap();
  let start: Option<Value> = evt.start_data().unwrap();
  assert_eq!(start, Some(json!({"image": "v10", "user": "alice"})));

  let unique_id = evt.unique_id;
  evt
    .done_custom_data(None, &json!({"result": "ok"}))
    .await
    .unwrap();

  let archived = service.get_by_id(unique_id).await.unwrap();
  let start: Option<Value> = archived.start_data().unwrap();
  assert_eq!(start, Some(json!({"image": "v10", "user": "alice"})));
  let end: Option<Value> = archived.end_data().unwrap();
  assert_eq!(end, Some(json!({"result": "ok"})));
}

#[tokio::test]
async fn test_custom_data_rejects_scalars() {
  let service = service();
  let mut opts = deploy_opts("myapp");
  opts.custom_data = Some(json!("just a string"));
  let err = service.new_event(opts).await.unwrap_err();
  assert_eq!(
    err.to_string(),
    "cannot use type string as event custom data"
  );
  // nothing was inserted
  assert!(service.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_other_custom_data_survives_done() {
  let service = service();
  let evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  evt
    .set_other_custom_data(&json!({"progress": 50}))
    .await
    .unwrap();
  let unique_id = evt.unique_id;
  evt.done(None).await.unwrap();

  let archived = service.get_by_id(unique_id).await.unwrap();
  let other: Option<Value> = archived.other_data().unwrap();
  assert_eq!(other, Some(json!({"progress": 50})));
}

#[tokio::test]
async fn test_abort_leaves_no_history() {
  let service = service();
  let evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  evt.abort().await.unwrap();
  assert!(service.all().await.unwrap().is_empty());

  // the slot is free again
  let evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  evt.done(None).await.unwrap();
}

#[tokio::test]
async fn test_log_capture() {
  let service = service();
  let mut evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  evt.logf("starting deploy");
  evt.write_all(b"raw output\n").unwrap();
  let unique_id = evt.unique_id;
  evt.done(None).await.unwrap();

  let archived = service.get_by_id(unique_id).await.unwrap();
  assert_eq!(archived.log, "starting deploy\nraw output\n");
}

#[tokio::test]
async fn test_heartbeat_keeps_lock_fresh() {
  let store = Arc::new(MemoryStore::new());
  let service = EventService::with_config(
    store,
    EventServiceConfig {
      lock_update_interval: Duration::from_millis(10),
      lock_expire_timeout: Duration::from_secs(3600),
    },
  );
  let evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  let created_at = evt.lock_update_time;

  tokio::time::sleep(Duration::from_millis(150)).await;

  let target = Target::new(TargetType::App, "myapp");
  let fresh = service.get_running(&target, "app.deploy").await.unwrap();
  assert!(fresh.lock_update_time > created_at);
  evt.done(None).await.unwrap();
  service.stop_updater().await;
}

struct DenyDeploys;

#[async_trait]
impl BlockChecker for DenyDeploys {
  async fn check(&self, event: &EventData) -> evlock::Result<()> {
    if event.kind.name == "app.deploy" {
      return Err(Error::Blocked("deploys are disabled".to_string()));
    }
    Ok(())
  }
}

#[tokio::test]
async fn test_block_checker_rolls_back_creation() {
  let service = service();
  service.set_block_checker(Arc::new(DenyDeploys));

  let err = service.new_event(deploy_opts("myapp")).await.unwrap_err();
  assert!(matches!(err, Error::Blocked(_)));

  // the rollback archived the event with the block error and freed the slot
  let events = service.all().await.unwrap();
  assert_eq!(events.len(), 1);
  assert!(!events[0].running);
  assert!(events[0].error.contains("deploys are disabled"));

  let scheme = PermissionScheme::new("app.restart");
  let evt = service
    .new_event(Opts {
      target: Some(Target::new(TargetType::App, "myapp")),
      kind: Some(scheme.clone()),
      owner: Some(Arc::new(UserToken("alice"))),
      allowed: AllowedPermission::new(&scheme, vec![]),
      ..Default::default()
    })
    .await
    .unwrap();
  evt.done(None).await.unwrap();
}

#[tokio::test]
async fn test_get_running_and_get_by_id() {
  let service = service();
  let target = Target::new(TargetType::App, "myapp");

  let err = service.get_running(&target, "app.deploy").await.unwrap_err();
  assert!(matches!(err, Error::EventNotFound));

  let evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  let running = service.get_running(&target, "app.deploy").await.unwrap();
  assert_eq!(running.unique_id, evt.unique_id);

  let err = service.get_running(&target, "app.restart").await.unwrap_err();
  assert!(matches!(err, Error::EventNotFound));

  let unique_id = evt.unique_id;
  evt.done(None).await.unwrap();
  let err = service.get_running(&target, "app.deploy").await.unwrap_err();
  assert!(matches!(err, Error::EventNotFound));

  let archived = service.get_by_id(unique_id).await.unwrap();
  assert_eq!(archived.unique_id, unique_id);
  let err = service.get_by_id(Uuid::new_v4()).await.unwrap_err();
  assert!(matches!(err, Error::EventNotFound));
}

#[tokio::test]
async fn test_mark_as_removed() {
  let service = service();
  let target = Target::new(TargetType::App, "myapp");
  let evt = service.new_event(deploy_opts("myapp")).await.unwrap();
  evt.done(None).await.unwrap();

  service.mark_as_removed(&target).await.unwrap();
  assert!(service.all().await.unwrap().is_empty());

  let filter = evlock::Filter {
    include_removed: true,
    ..Default::default()
  };
  let events = service.list(Some(&filter)).await.unwrap();
  assert_eq!(events.len(), 1);
  assert!(events[0].remove_date.is_some());
}

#[tokio::test]
async fn test_get_kinds() {
  let service = service();
  let evt = service.new_event(deploy_opts("a1")).await.unwrap();
  evt.done(None).await.unwrap();
  let evt = service.new_event(deploy_opts("a2")).await.unwrap();
  evt.done(None).await.unwrap();
  let scheme = PermissionScheme::new("node.autoscale");
  let evt = service
    .new_internal(Opts {
      target: Some(Target::new(TargetType::Pool, "pool1")),
      internal_kind: Some("autoscaler".to_string()),
      allowed: AllowedPermission::new(&scheme, vec![]),
      ..Default::default()
    })
    .await
    .unwrap();
  evt.done(None).await.unwrap();

  let mut kinds = service.get_kinds().await.unwrap();
  kinds.sort_by(|a, b| a.name.cmp(&b.name));
  assert_eq!(kinds.len(), 2);
  assert_eq!(kinds[0].name, "app.deploy");
  assert_eq!(kinds[1].name, "autoscaler");
}

#[tokio::test]
async fn test_migrate_rewrites_in_place() {
  let service = service();
  for value in ["a1", "a2"] {
    let evt = service.new_event(deploy_opts(value)).await.unwrap();
    evt.done(None).await.unwrap();
  }

  service
    .migrate(&json!({}), |data| {
      data.other_custom_data = Some(json!({"migrated": true}));
      Ok(())
    })
    .await
    .unwrap();

  let events = service.all().await.unwrap();
  assert_eq!(events.len(), 2);
  for evt in &events {
    let other: Option<Value> = evt.other_data().unwrap();
    assert_eq!(other, Some(json!({"migrated": true})));
    assert!(evt.id.is_unique());
  }
}

#[tokio::test]
async fn test_raw_insert() {
  let service = service();
  let unique_id = Uuid::new_v4();
  let now = Utc::now();
  let data = EventData {
    id: EventId::Unique(unique_id),
    unique_id,
    start_time: now,
    end_time: Some(now),
    target: Target::new(TargetType::App, "seeded"),
    start_custom_data: Some(json!({"image": "v1"})),
    end_custom_data: None,
    other_custom_data: None,
    kind: Kind::permission("app.deploy"),
    owner: Owner::new(OwnerType::User, "alice"),
    lock_update_time: now,
    error: String::new(),
    log: String::new(),
    remove_date: None,
    cancel_info: CancelInfo::default(),
    cancelable: false,
    running: false,
    allowed: AllowedPermission {
      scheme: "app.deploy".to_string(),
      contexts: vec![],
    },
    allowed_cancel: AllowedPermission::default(),
  };
  service.raw_insert(data).await.unwrap();

  let archived = service.get_by_id(unique_id).await.unwrap();
  assert!(!archived.running);
  let start: Option<Value> = archived.start_data().unwrap();
  assert_eq!(start, Some(json!({"image": "v1"})));
}
