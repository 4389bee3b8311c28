mod common;

use std::collections::BTreeSet;

use common::{indexer, indexer_with, names, obj, put};
use fleetq_core::{Object, Query, QueryOptions};
use fleetq_search::{IndexError, IndexReader, IndexWriter, IndexerConfig};
use tokio_util::sync::CancellationToken;

fn fleet() -> Vec<Object> {
    let mut web = obj("prod-eu", "default", "Deployment", "web");
    web.labels.push(("app".to_string(), "web".to_string()));
    vec![
        obj("prod-eu", "flux-system", "Kustomization", "infra"),
        obj("prod-eu", "flux-system", "HelmRelease", "nginx-ingress"),
        web,
        obj("prod-us", "default", "Deployment", "api"),
        obj("prod-us", "kube-system", "Deployment", "coredns"),
    ]
}

#[test]
fn added_objects_are_found_by_match_all() {
    let ix = indexer();
    let objs = fleet();
    put(&ix, &objs);
    let it = ix.search(&CancellationToken::new(), &Query::all(), &QueryOptions::default()).unwrap();
    let got: BTreeSet<String> = it.ids().into_iter().collect();
    let want: BTreeSet<String> = objs.iter().map(|o| o.id.clone()).collect();
    assert_eq!(got, want);
}

#[test]
fn default_order_is_name_descending() {
    let ix = indexer();
    let a = Object { id: "a".into(), name: "zeta".into(), ..Default::default() };
    let b = Object { id: "b".into(), name: "alpha".into(), ..Default::default() };
    put(&ix, &[a, b]);
    let cancel = CancellationToken::new();
    let desc = ix.search(&cancel, &Query::all(), &QueryOptions::default()).unwrap();
    assert_eq!(names(&desc), vec!["zeta", "alpha"]);
    let asc = ix.search(&cancel, &Query::all(), &QueryOptions::ascending()).unwrap();
    assert_eq!(names(&asc), vec!["alpha", "zeta"]);
}

#[test]
fn descending_reverses_ascending_for_every_sortable_field() {
    let ix = indexer();
    put(&ix, &fleet());
    let cancel = CancellationToken::new();
    for field in ["name", "kind", "namespace", "cluster", "id"] {
        let up = ix.search(&cancel, &Query::all(), &QueryOptions::ascending().order_by(field)).unwrap().ids();
        let mut down = ix.search(&cancel, &Query::all(), &QueryOptions::default().order_by(field)).unwrap().ids();
        down.reverse();
        assert_eq!(up, down, "field {field}");
    }
}

#[test]
fn offset_skips_leading_hits() {
    let ix = indexer();
    put(&ix, &fleet());
    let cancel = CancellationToken::new();
    let full = ix.search(&cancel, &Query::all(), &QueryOptions::ascending()).unwrap().ids();
    assert_eq!(full.len(), 5);
    for k in [0usize, 2, 5, 7] {
        let page = ix.search(&cancel, &Query::all(), &QueryOptions::ascending().offset(k)).unwrap().ids();
        assert_eq!(page.len(), full.len().saturating_sub(k));
        assert_eq!(page[..], full[k.min(full.len())..]);
    }
}

#[test]
fn result_cap_bounds_hits() {
    let ix = indexer_with(IndexerConfig { result_cap: 2, ..Default::default() });
    put(&ix, &fleet());
    let it = ix.search(&CancellationToken::new(), &Query::all(), &QueryOptions::ascending()).unwrap();
    assert_eq!(names(&it), vec!["api", "coredns"]);
}

#[test]
fn remove_hides_object_from_search() {
    let ix = indexer();
    let objs = fleet();
    put(&ix, &objs);
    let cancel = CancellationToken::new();
    ix.remove(&cancel, &objs[..2]).unwrap();
    let ids = ix.search(&cancel, &Query::all(), &QueryOptions::default()).unwrap().ids();
    assert_eq!(ids.len(), 3);
    assert!(!ids.contains(&objs[0].id));
    assert!(!ids.contains(&objs[1].id));
}

#[test]
fn remove_by_query_removes_exactly_the_hits() {
    let ix = indexer();
    let objs = fleet();
    put(&ix, &objs);
    let cancel = CancellationToken::new();
    let q = r#"cluster:"prod-eu""#;
    let doomed: BTreeSet<String> =
        ix.search(&cancel, &Query::all().with_filter(q), &QueryOptions::default()).unwrap().ids().into_iter().collect();
    assert_eq!(doomed.len(), 3);

    let removed = ix.remove_by_query(&cancel, q).unwrap();
    assert_eq!(removed, doomed.len());
    let left: BTreeSet<String> = ix.search(&cancel, &Query::all(), &QueryOptions::default()).unwrap().ids().into_iter().collect();
    let want: BTreeSet<String> = objs.iter().map(|o| o.id.clone()).filter(|id| !doomed.contains(id)).collect();
    assert_eq!(left, want);
}

#[test]
fn remove_by_query_is_not_limited_by_result_cap() {
    let ix = indexer_with(IndexerConfig { result_cap: 1, remove_batch_size: 2, ..Default::default() });
    let objs: Vec<Object> = (0..7).map(|i| obj("gone", "default", "ConfigMap", &format!("cm-{i}"))).collect();
    put(&ix, &objs);
    put(&ix, &[obj("kept", "default", "ConfigMap", "cm-x")]);
    let cancel = CancellationToken::new();
    assert_eq!(ix.remove_by_query(&cancel, "cluster:gone").unwrap(), 7);
    assert_eq!(ix.engine().num_docs(), 1);
    assert_eq!(ix.remove_by_query(&cancel, "   ").unwrap(), 0);
}

#[test]
fn namespace_facet_keeps_hyphenated_values_whole() {
    let ix = indexer();
    put(&ix, &[
        obj("c1", "flux-system", "Kustomization", "a"),
        obj("c1", "flux-system", "Kustomization", "b"),
        obj("c1", "default", "ConfigMap", "c"),
    ]);
    let facets = ix.list_facets(&CancellationToken::new()).unwrap();
    let ns: BTreeSet<&str> = facets["Namespace"].iter().map(String::as_str).collect();
    assert_eq!(ns, BTreeSet::from(["flux-system", "default"]));
    assert_eq!(facets["Namespace"][0], "flux-system", "most frequent first");
    let kinds: BTreeSet<&str> = facets["Kind"].iter().map(String::as_str).collect();
    assert_eq!(kinds, BTreeSet::from(["Kustomization", "ConfigMap"]));
    assert_eq!(facets["Cluster"], vec!["c1"]);
}

#[test]
fn facets_follow_upserts_and_respect_cap() {
    let objs = [obj("c1", "a", "Pod", "x"), obj("c1", "b", "Pod", "y"), obj("c1", "b", "Pod", "z")];
    let cancel = CancellationToken::new();

    let capped = indexer_with(IndexerConfig { facet_size: 1, ..Default::default() });
    put(&capped, &objs);
    assert_eq!(capped.list_facets(&cancel).unwrap()["Namespace"], vec!["b"]);

    let ix = indexer();
    put(&ix, &objs);
    assert_eq!(ix.list_facets(&cancel).unwrap()["Namespace"], vec!["b", "a"]);
    // moving x out of namespace "a" removes the value entirely
    let mut moved = obj("c1", "b", "Pod", "x");
    moved.id = objs[0].id.clone();
    put(&ix, &[moved]);
    assert_eq!(ix.list_facets(&cancel).unwrap()["Namespace"], vec!["b"]);
}

#[test]
fn free_text_matches_tokens_and_exact_values() {
    let ix = indexer();
    put(&ix, &fleet());
    let cancel = CancellationToken::new();
    let it = ix.search(&cancel, &Query::terms("nginx"), &QueryOptions::default()).unwrap();
    assert_eq!(names(&it), vec!["nginx-ingress"]);
    let it = ix.search(&cancel, &Query::terms("kube-system"), &QueryOptions::default()).unwrap();
    assert_eq!(names(&it), vec!["coredns"]);
    let it = ix.search(&cancel, &Query::terms("nothing-like-this"), &QueryOptions::default()).unwrap();
    assert!(it.is_empty());
}

#[test]
fn filters_are_case_insensitive_and_conjunctive() {
    let ix = indexer();
    put(&ix, &fleet());
    let cancel = CancellationToken::new();
    let q = Query::all().with_filter("Namespace:DEFAULT");
    assert_eq!(names(&ix.search(&cancel, &q, &QueryOptions::ascending()).unwrap()), vec!["api", "web"]);

    let q = Query::all().with_filter("namespace:default").with_filter(r#"cluster:"prod-us""#);
    assert_eq!(names(&ix.search(&cancel, &q, &QueryOptions::ascending()).unwrap()), vec!["api"]);

    let q = Query::terms("web").with_filter("kind:deployment");
    assert_eq!(names(&ix.search(&cancel, &q, &QueryOptions::ascending()).unwrap()), vec!["web"]);
}

#[test]
fn label_filter_matches_key_value() {
    let ix = indexer();
    put(&ix, &fleet());
    let q = Query::all().with_filter(r#"labels:"app=web""#);
    let it = ix.search(&CancellationToken::new(), &q, &QueryOptions::default()).unwrap();
    assert_eq!(names(&it), vec!["web"]);
}

#[test]
fn unknown_filter_field_matches_nothing() {
    let ix = indexer();
    put(&ix, &fleet());
    let q = Query::all().with_filter("colour:blue");
    assert!(ix.search(&CancellationToken::new(), &q, &QueryOptions::default()).unwrap().is_empty());
}

#[test]
fn malformed_filter_fails_search_and_remove() {
    let ix = indexer();
    put(&ix, &fleet());
    let cancel = CancellationToken::new();
    let q = Query::all().with_filter("namespace:(default");
    assert!(matches!(ix.search(&cancel, &q, &QueryOptions::default()), Err(IndexError::Query { .. })));
    assert!(matches!(ix.remove_by_query(&cancel, "namespace:(default"), Err(IndexError::Query { .. })));
    assert_eq!(ix.engine().num_docs(), 5);
}

#[test]
fn hydration_reads_the_store_at_consumption_time() {
    let ix = indexer();
    let objs = fleet();
    put(&ix, &objs);
    let cancel = CancellationToken::new();
    let it = ix.search(&cancel, &Query::all(), &QueryOptions::ascending()).unwrap();

    // api: updated in the store only; coredns: deleted from the store only
    let mut api = objs[3].clone();
    api.status = "Degraded".to_string();
    ix.store().store_objects(&cancel, &[api]).unwrap();
    ix.store().delete_objects(&cancel, &objs[4..5]).unwrap();

    assert!(it.advance());
    assert_eq!(it.row().unwrap().status, "Degraded");
    assert!(it.advance());
    let err = it.row().unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(it.all().unwrap_err().is_not_found());
    // later rows are unaffected
    assert!(it.advance());
    assert_eq!(it.row().unwrap().name, "infra");
}

#[test]
fn all_hydrates_in_search_order() {
    let ix = indexer();
    put(&ix, &fleet());
    let cancel = CancellationToken::new();
    let it = ix.search(&cancel, &Query::all(), &QueryOptions::default().order_by("cluster").offset(1)).unwrap();
    let ids = it.ids();
    let all: Vec<String> = it.all().unwrap().into_iter().map(|o| o.id).collect();
    assert_eq!(all, ids);
    assert_eq!(all.len(), 4);
}

#[test]
fn cancelled_operations_do_nothing() {
    let ix = indexer();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(ix.add(&cancel, &fleet()), Err(IndexError::Cancelled)));
    assert!(matches!(ix.search(&cancel, &Query::all(), &QueryOptions::default()), Err(IndexError::Cancelled)));
    assert!(matches!(ix.list_facets(&cancel), Err(IndexError::Cancelled)));
    assert_eq!(ix.engine().num_docs(), 0);
}

#[test]
fn remove_by_query_selects_what_search_selects() {
    for q in ["namespace:a OR namespace:b", r#"ID:"c1/a/Pod/p1""#, "Namespace:C"] {
        let ix = indexer();
        let objs = [obj("c1", "a", "Pod", "p1"), obj("c1", "b", "Pod", "p2"), obj("c1", "c", "Pod", "p3")];
        put(&ix, &objs);
        let cancel = CancellationToken::new();
        let hits: BTreeSet<String> =
            ix.search(&cancel, &Query::all().with_filter(q), &QueryOptions::default()).unwrap().ids().into_iter().collect();
        assert!(!hits.is_empty(), "{q}");
        assert_eq!(ix.remove_by_query(&cancel, q).unwrap(), hits.len(), "{q}");
        let left: BTreeSet<String> = ix.search(&cancel, &Query::all(), &QueryOptions::default()).unwrap().ids().into_iter().collect();
        assert!(left.is_disjoint(&hits), "{q}");
        assert_eq!(left.len() + hits.len(), objs.len(), "{q}");
    }
}

#[test]
fn id_filter_finds_object_by_its_id() {
    let ix = indexer();
    let objs = fleet();
    put(&ix, &objs);
    let target = &objs[1];
    let q = Query::all().with_filter(format!("id:\"{}\"", target.id));
    let it = ix.search(&CancellationToken::new(), &q, &QueryOptions::default()).unwrap();
    assert_eq!(it.ids(), vec![target.id.clone()]);
}

#[test]
fn sort_ignores_case() {
    let ix = indexer();
    let a = Object { id: "a".into(), name: "Zeta".into(), ..Default::default() };
    let b = Object { id: "b".into(), name: "alpha".into(), ..Default::default() };
    put(&ix, &[a, b]);
    let cancel = CancellationToken::new();
    let asc = ix.search(&cancel, &Query::all(), &QueryOptions::ascending()).unwrap();
    assert_eq!(names(&asc), vec!["alpha", "Zeta"]);
    let all: Vec<String> = ix.search(&cancel, &Query::all(), &QueryOptions::ascending()).unwrap().all().unwrap().into_iter().map(|o| o.name).collect();
    assert_eq!(all, vec!["alpha", "Zeta"]);
    let desc = ix.search(&cancel, &Query::all(), &QueryOptions::default()).unwrap();
    assert_eq!(names(&desc), vec!["Zeta", "alpha"]);
}
