use fleetq_core::{Object, QueryOptions};
use fleetq_store::{ObjectStore, SqliteStore};
use tokio_util::sync::CancellationToken;

fn open(dir: &tempfile::TempDir) -> SqliteStore {
    SqliteStore::open(&dir.path().join("objects.db").to_string_lossy()).unwrap()
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let mut o = Object::new("eu", "flux-system", "Kustomization", "infra");
    o.labels.push(("app.kubernetes.io/name".to_string(), "infra".to_string()));
    o.payload = serde_json::json!({ "spec": { "path": "./infra" } });
    {
        let s = open(&dir);
        s.store_objects(&cancel, &[o.clone()]).unwrap();
    }
    let s = open(&dir);
    assert_eq!(s.get_object_by_id(&cancel, &o.id).unwrap(), o);
}

#[test]
fn batch_lookup_spans_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let s = open(&dir);
    let cancel = CancellationToken::new();
    let objs: Vec<Object> = (0..1_234).map(|i| Object::new("eu", "default", "Pod", &format!("p{i:05}"))).collect();
    s.store_objects(&cancel, &objs).unwrap();
    let ids: Vec<String> = objs.iter().map(|o| o.id.clone()).collect();
    let got = s.get_objects(&cancel, &ids, &QueryOptions::ascending()).unwrap();
    assert_eq!(got.len(), objs.len());
    assert_eq!(got.first().map(|o| o.name.as_str()), Some("p00000"));
    assert_eq!(got.last().map(|o| o.name.as_str()), Some("p01233"));
}

#[test]
fn concurrent_writers_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let s = open(&dir);
    let cancel = CancellationToken::new();
    std::thread::scope(|scope| {
        for t in 0..4 {
            let (s, cancel) = (&s, &cancel);
            scope.spawn(move || {
                for i in 0..50 {
                    let mut o = Object::new("eu", "default", "Pod", &format!("p{i}"));
                    o.status = format!("writer-{t}");
                    s.store_objects(cancel, &[o]).unwrap();
                }
            });
        }
    });
    assert_eq!(s.count().unwrap(), 50);
}
