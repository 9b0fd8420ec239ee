use runcast::profiles::{ProfileError, ProfileStore};
use runcast::shared::{ManualClock, SequentialIds};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn store_at(dir: &Path) -> (ProfileStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = ProfileStore::new(dir.join("profiles"))
        .with_clock(clock.clone())
        .with_ids(Arc::new(SequentialIds::new()));
    (store, clock)
}

#[test]
fn profile_lifecycle_orders_by_use_and_clears_bindings_on_delete() {
    let dir = tempdir().expect("tempdir");
    let (store, clock) = store_at(dir.path());

    let first = store.create("").expect("create first");
    assert_eq!(first.display_name, "Session 1");
    clock.advance_millis(10);
    let second = store.create("Research").expect("create second");
    assert_eq!(store.list().expect("list")[0].id, second.id);

    clock.advance_millis(10);
    let saved = store
        .save_state(first.id.as_str(), &[1, 2, 3])
        .expect("save state");
    assert_eq!(saved.last_used_at, 1_020);
    assert_eq!(saved.serialized_state, vec![1, 2, 3]);
    let listed = store.list().expect("list");
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[0].serialized_state, vec![1, 2, 3]);

    store.set_active("sess-X", first.id.as_str());
    assert_eq!(store.get_active("sess-X"), first.id.as_str());
    store.delete(first.id.as_str()).expect("delete");
    assert_eq!(store.get_active("sess-X"), "");
    assert_eq!(store.clear_for_profile(first.id.as_str()), 0);
    assert!(matches!(
        store.get(first.id.as_str()),
        Err(ProfileError::NotFound { .. })
    ));
    assert!(matches!(
        store.delete(first.id.as_str()),
        Err(ProfileError::NotFound { .. })
    ));
}

#[test]
fn saved_profile_lists_first_even_within_the_same_millisecond() {
    let dir = tempdir().expect("tempdir");
    let (store, clock) = store_at(dir.path());
    let older = store.create("A").expect("create older");
    clock.advance_millis(5);
    let newer = store.create("B").expect("create newer");

    let saved = store.save_state(older.id.as_str(), b"state").expect("save");
    assert!(saved.last_used_at > newer.last_used_at);
    let listed = store.list().expect("list");
    assert_eq!(listed[0].id, older.id);
    assert_eq!(listed[1].id, newer.id);

    let touched = store.touch(newer.id.as_str()).expect("touch");
    assert!(touched.last_used_at > saved.last_used_at);
    assert_eq!(store.most_recent().expect("recent").expect("some").id, newer.id);
}

#[test]
fn empty_state_keeps_previous_blob_but_marks_use() {
    let dir = tempdir().expect("tempdir");
    let (store, clock) = store_at(dir.path());
    let profile = store.create("Work").expect("create");
    store
        .save_state(profile.id.as_str(), b"cookie")
        .expect("save state");
    clock.advance_millis(50);
    let touched = store.save_state(profile.id.as_str(), &[]).expect("save empty");
    assert_eq!(touched.serialized_state, b"cookie".to_vec());
    assert_eq!(touched.last_used_at, 1_050);
    assert_eq!(store.most_recent().expect("recent").expect("some").id, profile.id);
}

#[test]
fn missing_directory_is_recreated_on_first_operation() {
    let dir = tempdir().expect("tempdir");
    let (store, _) = store_at(dir.path());
    assert!(store.list().expect("list").is_empty());
    assert!(store.dir().is_dir());

    fs::remove_dir_all(store.dir()).expect("remove profiles dir");
    let profile = store.create("again").expect("create after removal");
    assert_eq!(store.get(profile.id.as_str()).expect("get").display_name, "again");
}

#[test]
fn unreadable_profile_files_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let (store, _) = store_at(dir.path());
    let profile = store.create("ok").expect("create");
    fs::write(store.dir().join("broken.json"), "{not json").expect("write broken");
    fs::write(store.dir().join("notes.txt"), "ignored").expect("write other");

    let listed = store.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, profile.id);
}

#[test]
fn invalid_ids_are_rejected_before_touching_disk() {
    let dir = tempdir().expect("tempdir");
    let (store, _) = store_at(dir.path());
    assert!(matches!(
        store.get("../escape"),
        Err(ProfileError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.touch(""),
        Err(ProfileError::InvalidArgument(_))
    ));
}

#[test]
fn empty_session_or_profile_binding_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let (store, _) = store_at(dir.path());
    store.set_active("", "prof-1");
    store.set_active("sess-1", "");
    assert_eq!(store.get_active("sess-1"), "");

    store.set_active("sess-1", "prof-1");
    store.set_active("sess-2", "prof-1");
    assert_eq!(store.clear_active("sess-1"), "prof-1");
    assert_eq!(store.clear_active("sess-1"), "");
    assert_eq!(store.clear_for_profile("prof-1"), 1);
}

#[test]
fn concurrent_creates_all_persist() {
    let dir = tempdir().expect("tempdir");
    let (store, _) = store_at(dir.path());
    let store = Arc::new(store);
    let handles = (0..8)
        .map(|index| {
            let store = Arc::clone(&store);
            thread::spawn(move || store.create(&format!("p{index}")).expect("create"))
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(store.list().expect("list").len(), 8);
}
