//! Shared objects and deep archives across regions

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::builders::{assert_same_graph, ObjectGraphBuilder};
use parking_lot::Mutex;
use pipehub::archive::{
    ArchiveFormat, DeepArchiveFetcher, DeepArchiveSaver, Fetcher, ObjectRecord, Resolution,
};
use pipehub::error::ObjectError;
use pipehub::object::{Meta, Object, ObjectType, SharedRegion};

#[test]
fn test_refcount_lifecycle_releases_name() {
    let region = SharedRegion::new("refs", 1, 0);
    for extra in [0usize, 1, 5] {
        let obj = region.create_object(ObjectType::Points, Meta::default());
        let name = obj.name().to_string();
        for i in 0..extra {
            assert_eq!(obj.add_ref(), i + 2);
        }
        for i in (0..extra).rev() {
            assert_eq!(obj.unref(), i + 1);
            assert!(region.object(&name).is_some());
        }
        drop(obj);
        assert!(region.object(&name).is_none());
        assert!(!region.contains_object(&name));

        let again = region
            .create_object_named(&name, ObjectType::Points, Meta::default())
            .unwrap();
        assert!(region.contains_object(again.name()));
    }
}

#[test]
fn test_dropping_top_releases_graph() {
    let region = SharedRegion::new("refs", 1, 0);
    let top = ObjectGraphBuilder::new().nested(5).arrays(5).build(&region);
    assert_eq!(region.object_count(), 6);
    assert_eq!(region.array_count(), 5);
    drop(top);
    assert_eq!(region.object_count(), 0);
    assert_eq!(region.array_count(), 0);
}

fn round_trip(nested: usize, arrays: usize, format: ArchiveFormat) {
    let src = SharedRegion::new("src", 1, 0);
    let orig = ObjectGraphBuilder::new()
        .nested(nested)
        .arrays(arrays)
        .build(&src);

    let mut saver = DeepArchiveSaver::new(format);
    let blob = saver.save(&orig).unwrap();
    let directory = saver.into_directory();
    assert_eq!(directory.len(), nested + arrays);

    let dst = SharedRegion::new("dst", 2, 0);
    let fetcher = DeepArchiveFetcher::new(dst.clone(), directory);
    let loaded = fetcher.load(&blob).unwrap();
    assert!(loaded.is_complete_deep(), "N={nested} M={arrays}");
    assert_eq!(fetcher.pending_count(), 0);
    assert_same_graph(&orig, &loaded);
    assert_eq!(dst.object_count(), nested + 1);
    assert_eq!(dst.array_count(), arrays);
}

#[test]
fn test_round_trip_sizes() {
    for nested in [0, 1, 5, 50] {
        for arrays in [0, 1, 5, 50] {
            round_trip(nested, arrays, ArchiveFormat::Bincode);
        }
    }
}

#[test]
fn test_round_trip_json() {
    round_trip(5, 5, ArchiveFormat::Json);
}

#[test]
fn test_self_attachment_forbidden() {
    let region = SharedRegion::new("cyc", 1, 0);
    let obj = region.create_object(ObjectType::Empty, Meta::default());
    assert!(matches!(
        obj.add_attachment("me", &obj),
        Err(ObjectError::Cycle { .. })
    ));

    // an archive claiming the same loop is not materialized
    let record = ObjectRecord {
        name: "loop".into(),
        object_type: ObjectType::Empty,
        meta: Meta::default(),
        attributes: Default::default(),
        attachments: vec![("me".into(), "loop".into())],
        children: vec![],
        arrays: vec![],
    };
    let blob = ArchiveFormat::Bincode.encode(&record).unwrap();
    let fetcher = DeepArchiveFetcher::from_maps(region.clone(), HashMap::new(), HashMap::new());
    let loaded = fetcher.load(&blob).unwrap();
    assert!(!loaded.is_complete());
    assert!(!loaded.has_attachment("me"));
}

#[test]
fn test_request_missing_object_then_retry() {
    let dst = SharedRegion::new("dst", 2, 0);
    let fetcher = DeepArchiveFetcher::from_maps(dst.clone(), HashMap::new(), HashMap::new());

    let received: Arc<Mutex<Option<Object>>> = Arc::new(Mutex::new(None));
    let slot = received.clone();
    let res = fetcher.request_object("X", Box::new(move |obj| *slot.lock() = Some(obj)));
    assert_eq!(res, Resolution::Incomplete);
    assert!(received.lock().is_none());
    assert_eq!(fetcher.pending_count(), 1);

    // the blob shows up later
    let src = SharedRegion::new("src", 1, 0);
    let x = src
        .create_object_named("X", ObjectType::Lines, Meta::default())
        .unwrap();
    x.set_array("coords", src.create_vector_from(vec![1.0f64, 2.0]));
    let mut saver = DeepArchiveSaver::default();
    let blob = saver.save(&x).unwrap();
    fetcher.add_object_blob("X", blob);
    fetcher.add_directory(saver.into_directory());

    assert_eq!(fetcher.retry(), 0);
    let got = received.lock().take().unwrap();
    assert_eq!(got.name(), "X");
    assert!(got.is_complete());
    assert_eq!(got.vector::<f64>("coords").unwrap().to_vec(), vec![1.0, 2.0]);
}

#[test]
fn test_partial_directory_completes_on_retry() {
    let src = SharedRegion::new("src", 1, 0);
    let orig = ObjectGraphBuilder::new().nested(1).arrays(1).build(&src);
    let mut saver = DeepArchiveSaver::default();
    let blob = saver.save(&orig).unwrap();
    let (objects, arrays) = saver.into_directory().into_maps();

    let dst = SharedRegion::new("dst", 2, 0);
    let fetcher = DeepArchiveFetcher::from_maps(dst, HashMap::new(), arrays);
    let loaded = fetcher.load(&blob).unwrap();
    assert!(!loaded.is_complete());

    for (name, blob) in objects {
        fetcher.add_object_blob(name, blob);
    }
    assert_eq!(fetcher.retry(), 0);
    assert!(loaded.is_complete_deep());
    assert_same_graph(&orig, &loaded);
}
